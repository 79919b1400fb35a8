use std::collections::{HashMap, HashSet};

use crate::class_reader::{
    AttributeInfo, BootstrapMethod, ClassFile, CodeAttribute, CpInfo, ExceptionTableEntry,
    FieldInfo, LineNumber, LocalVariable, MethodInfo, cp_class_name, cp_member_ref,
    cp_name_and_type, cp_utf8,
};
use crate::constants;
use crate::error::ClassWriteError;
use crate::frames::{self, FrameMethod};
use crate::hierarchy::{ClassHierarchy, ClassInfo, Overlay};
use crate::insn::{
    AbstractInsnNode, ClassRef, Insn, JumpInsnNode, LabelNode, LdcValue, LineNumberInsnNode,
    LocalVariableNode, MemberRef, NodeList,
};
use crate::nodes::MethodBody;
use crate::opcodes;

/// Deduplicating constant pool writer.
///
/// [`ConstantPoolBuilder::from_pool`] starts from an existing pool and only
/// ever appends, so every index the original class uses stays valid.
#[derive(Debug, Default)]
pub struct ConstantPoolBuilder {
    cp: Vec<CpInfo>,
    utf8: HashMap<String, u16>,
    class: HashMap<String, u16>,
    string: HashMap<String, u16>,
    integer: HashMap<i32, u16>,
    name_and_type: HashMap<(String, String), u16>,
    field_ref: HashMap<(String, String, String), u16>,
    method_ref: HashMap<(String, String, String), u16>,
    interface_method_ref: HashMap<(String, String, String), u16>,
    method_handle: HashMap<(u8, u16), u16>,
    method_type: HashMap<String, u16>,
    invoke_dynamic: HashMap<(u16, u16), u16>,
    bootstrap_methods: Vec<BootstrapMethod>,
}

impl ConstantPoolBuilder {
    pub fn new() -> Self {
        Self {
            cp: vec![CpInfo::Unusable],
            ..Default::default()
        }
    }

    /// Continues an existing pool and `BootstrapMethods` table.
    pub fn from_pool(cp: Vec<CpInfo>, bootstrap_methods: Vec<BootstrapMethod>) -> Self {
        let mut builder = Self {
            cp,
            bootstrap_methods,
            ..Default::default()
        };
        if builder.cp.is_empty() {
            builder.cp.push(CpInfo::Unusable);
        }
        builder.index_existing();
        builder
    }

    fn index_existing(&mut self) {
        for (index, entry) in self.cp.iter().enumerate() {
            let index = index as u16;
            match entry {
                CpInfo::Utf8(value) => {
                    self.utf8.entry(value.clone()).or_insert(index);
                }
                CpInfo::Integer(value) => {
                    self.integer.entry(*value).or_insert(index);
                }
                CpInfo::Class { .. } => {
                    if let Ok(name) = cp_class_name(&self.cp, index) {
                        self.class.entry(name.to_string()).or_insert(index);
                    }
                }
                CpInfo::String { string_index } => {
                    if let Ok(value) = cp_utf8(&self.cp, *string_index) {
                        self.string.entry(value.to_string()).or_insert(index);
                    }
                }
                CpInfo::NameAndType { .. } => {
                    if let Ok((name, desc)) = cp_name_and_type(&self.cp, index) {
                        self.name_and_type
                            .entry((name.to_string(), desc.to_string()))
                            .or_insert(index);
                    }
                }
                CpInfo::Fieldref { .. } | CpInfo::Methodref { .. } | CpInfo::InterfaceMethodref { .. } => {
                    let Ok((owner, name, desc)) = cp_member_ref(&self.cp, index) else {
                        continue;
                    };
                    let key = (owner.to_string(), name.to_string(), desc.to_string());
                    let map = match entry {
                        CpInfo::Fieldref { .. } => &mut self.field_ref,
                        CpInfo::Methodref { .. } => &mut self.method_ref,
                        _ => &mut self.interface_method_ref,
                    };
                    map.entry(key).or_insert(index);
                }
                CpInfo::MethodHandle {
                    reference_kind,
                    reference_index,
                } => {
                    self.method_handle
                        .entry((*reference_kind, *reference_index))
                        .or_insert(index);
                }
                CpInfo::MethodType { descriptor_index } => {
                    if let Ok(desc) = cp_utf8(&self.cp, *descriptor_index) {
                        self.method_type.entry(desc.to_string()).or_insert(index);
                    }
                }
                CpInfo::InvokeDynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    self.invoke_dynamic
                        .entry((*bootstrap_method_attr_index, *name_and_type_index))
                        .or_insert(index);
                }
                _ => {}
            }
        }
    }

    pub fn pool(&self) -> &[CpInfo] {
        &self.cp
    }

    /// The finished pool and bootstrap table. Fails once the pool no longer
    /// fits a `u16` count.
    pub fn finish(self) -> Result<(Vec<CpInfo>, Vec<BootstrapMethod>), ClassWriteError> {
        if self.cp.len() > u16::MAX as usize {
            return Err(ClassWriteError::ConstantPoolOverflow(self.cp.len()));
        }
        Ok((self.cp, self.bootstrap_methods))
    }

    pub fn utf8(&mut self, value: &str) -> u16 {
        if let Some(index) = self.utf8.get(value) {
            return *index;
        }
        let index = self.push(CpInfo::Utf8(value.to_string()));
        self.utf8.insert(value.to_string(), index);
        index
    }

    pub fn class(&mut self, name: &str) -> u16 {
        if let Some(index) = self.class.get(name) {
            return *index;
        }
        let name_index = self.utf8(name);
        let index = self.push(CpInfo::Class { name_index });
        self.class.insert(name.to_string(), index);
        index
    }

    pub fn string(&mut self, value: &str) -> u16 {
        if let Some(index) = self.string.get(value) {
            return *index;
        }
        let string_index = self.utf8(value);
        let index = self.push(CpInfo::String { string_index });
        self.string.insert(value.to_string(), index);
        index
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        if let Some(index) = self.integer.get(&value) {
            return *index;
        }
        let index = self.push(CpInfo::Integer(value));
        self.integer.insert(value, index);
        index
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let key = (name.to_string(), descriptor.to_string());
        if let Some(index) = self.name_and_type.get(&key) {
            return *index;
        }
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let index = self.push(CpInfo::NameAndType {
            name_index,
            descriptor_index,
        });
        self.name_and_type.insert(key, index);
        index
    }

    pub fn field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let key = (owner.to_string(), name.to_string(), descriptor.to_string());
        if let Some(index) = self.field_ref.get(&key) {
            return *index;
        }
        let class_index = self.class(owner);
        let name_and_type_index = self.name_and_type(name, descriptor);
        let index = self.push(CpInfo::Fieldref {
            class_index,
            name_and_type_index,
        });
        self.field_ref.insert(key, index);
        index
    }

    pub fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let key = (owner.to_string(), name.to_string(), descriptor.to_string());
        if let Some(index) = self.method_ref.get(&key) {
            return *index;
        }
        let class_index = self.class(owner);
        let name_and_type_index = self.name_and_type(name, descriptor);
        let index = self.push(CpInfo::Methodref {
            class_index,
            name_and_type_index,
        });
        self.method_ref.insert(key, index);
        index
    }

    pub fn interface_method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let key = (owner.to_string(), name.to_string(), descriptor.to_string());
        if let Some(index) = self.interface_method_ref.get(&key) {
            return *index;
        }
        let class_index = self.class(owner);
        let name_and_type_index = self.name_and_type(name, descriptor);
        let index = self.push(CpInfo::InterfaceMethodref {
            class_index,
            name_and_type_index,
        });
        self.interface_method_ref.insert(key, index);
        index
    }

    /// A handle to a static method of a class (not an interface).
    pub fn static_method_handle(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let reference_index = self.method_ref(owner, name, descriptor);
        let key = (constants::REF_INVOKE_STATIC, reference_index);
        if let Some(index) = self.method_handle.get(&key) {
            return *index;
        }
        let index = self.push(CpInfo::MethodHandle {
            reference_kind: constants::REF_INVOKE_STATIC,
            reference_index,
        });
        self.method_handle.insert(key, index);
        index
    }

    pub fn method_type(&mut self, descriptor: &str) -> u16 {
        if let Some(index) = self.method_type.get(descriptor) {
            return *index;
        }
        let descriptor_index = self.utf8(descriptor);
        let index = self.push(CpInfo::MethodType { descriptor_index });
        self.method_type.insert(descriptor.to_string(), index);
        index
    }

    /// Index into the `BootstrapMethods` table, reusing an identical entry.
    pub fn bootstrap_method(&mut self, method_handle: u16, arguments: Vec<u16>) -> u16 {
        let entry = BootstrapMethod {
            bootstrap_method_ref: method_handle,
            bootstrap_arguments: arguments,
        };
        if let Some(index) = self.bootstrap_methods.iter().position(|bsm| *bsm == entry) {
            return index as u16;
        }
        self.bootstrap_methods.push(entry);
        (self.bootstrap_methods.len() - 1) as u16
    }

    pub fn invoke_dynamic(&mut self, bootstrap_index: u16, name: &str, descriptor: &str) -> u16 {
        let name_and_type_index = self.name_and_type(name, descriptor);
        let key = (bootstrap_index, name_and_type_index);
        if let Some(index) = self.invoke_dynamic.get(&key) {
            return *index;
        }
        let index = self.push(CpInfo::InvokeDynamic {
            bootstrap_method_attr_index: bootstrap_index,
            name_and_type_index,
        });
        self.invoke_dynamic.insert(key, index);
        index
    }

    fn push(&mut self, entry: CpInfo) -> u16 {
        self.cp.push(entry);
        (self.cp.len() - 1) as u16
    }
}

/// Assembles a label-addressed body into a `Code` attribute.
///
/// Branch and switch offsets, the exception table, `LineNumberTable`,
/// `LocalVariableTable` and `LocalVariableTypeTable` are all resolved from
/// labels. `max_stack`/`max_locals` are copied from the body; callers that
/// changed the code recompute them with [`frames::recompute`].
pub fn assemble(body: &MethodBody, cp: &mut ConstantPoolBuilder) -> Result<CodeAttribute, ClassWriteError> {
    // Jumps that do not reach with a 16-bit offset are widened and the body
    // laid out again. Widening only ever grows the code, so this settles.
    let mut widened = HashSet::new();
    let Layout {
        mut code,
        label_offsets,
        lines,
        jump_fixups,
        switch_fixups,
    } = loop {
        let layout = lay_out(body, cp, &widened)?;
        let mut grew = false;
        for fixup in &layout.jump_fixups {
            if !fixup.wide && i16::try_from(layout.delta(fixup)?).is_err() {
                widened.insert(fixup.node);
                grew = true;
            }
        }
        if !grew {
            break layout;
        }
    };
    if code.len() > u16::MAX as usize {
        return Err(ClassWriteError::CodeTooLarge(code.len()));
    }

    let resolve = |label: LabelNode| -> Result<usize, ClassWriteError> {
        label_offsets
            .get(&label.id)
            .copied()
            .ok_or(ClassWriteError::UnresolvedLabel(label.id))
    };

    for fixup in jump_fixups {
        let delta = resolve(fixup.target)? as i64 - fixup.start as i64;
        if fixup.wide {
            write_i4_at(&mut code, fixup.at, delta as i32);
        } else {
            write_i2_at(&mut code, fixup.at, delta as i16);
        }
    }
    for fixup in switch_fixups {
        let target = resolve(fixup.target)?;
        write_i4_at(&mut code, fixup.at, (target as i64 - fixup.start as i64) as i32);
    }

    let mut exception_table = Vec::with_capacity(body.try_catch_blocks.len());
    for block in &body.try_catch_blocks {
        exception_table.push(ExceptionTableEntry {
            start_pc: resolve(block.start)? as u16,
            end_pc: resolve(block.end)? as u16,
            handler_pc: resolve(block.handler)? as u16,
            catch_type: block.catch_type,
        });
    }

    let mut attributes = Vec::new();
    if !lines.is_empty() {
        let mut entries = Vec::with_capacity(lines.len());
        for line in lines {
            entries.push(LineNumber {
                start_pc: resolve(line.start)? as u16,
                line_number: line.line,
            });
        }
        attributes.push(AttributeInfo::LineNumberTable { entries });
    }
    if !body.local_variables.is_empty() {
        attributes.push(AttributeInfo::LocalVariableTable {
            entries: local_variable_entries(&body.local_variables, &resolve)?,
        });
    }
    if !body.local_variable_types.is_empty() {
        attributes.push(AttributeInfo::LocalVariableTypeTable {
            entries: local_variable_entries(&body.local_variable_types, &resolve)?,
        });
    }

    Ok(CodeAttribute {
        max_stack: body.max_stack,
        max_locals: body.max_locals,
        code,
        exception_table,
        attributes,
    })
}

fn local_variable_entries<F>(nodes: &[LocalVariableNode], resolve: &F) -> Result<Vec<LocalVariable>, ClassWriteError>
where
    F: Fn(LabelNode) -> Result<usize, ClassWriteError>,
{
    let mut entries = Vec::with_capacity(nodes.len());
    for node in nodes {
        let start = resolve(node.start)?;
        let end = resolve(node.end)?;
        entries.push(LocalVariable {
            start_pc: start as u16,
            length: end.saturating_sub(start) as u16,
            name_index: node.name_index,
            descriptor_index: node.descriptor_index,
            index: node.index,
        });
    }
    Ok(entries)
}

/// Code with placeholder offsets, and where the offsets go.
struct Layout {
    code: Vec<u8>,
    label_offsets: HashMap<usize, usize>,
    lines: Vec<LineNumberInsnNode>,
    jump_fixups: Vec<JumpFixup>,
    switch_fixups: Vec<SwitchFixup>,
}

impl Layout {
    fn delta(&self, fixup: &JumpFixup) -> Result<i64, ClassWriteError> {
        let target = self
            .label_offsets
            .get(&fixup.target.id)
            .copied()
            .ok_or(ClassWriteError::UnresolvedLabel(fixup.target.id))?;
        Ok(target as i64 - fixup.start as i64)
    }
}

fn lay_out(
    body: &MethodBody,
    cp: &mut ConstantPoolBuilder,
    widened: &HashSet<usize>,
) -> Result<Layout, ClassWriteError> {
    let mut layout = Layout {
        code: Vec::new(),
        label_offsets: HashMap::new(),
        lines: Vec::new(),
        jump_fixups: Vec::new(),
        switch_fixups: Vec::new(),
    };
    for (index, node) in body.instructions.nodes().iter().enumerate() {
        match node {
            AbstractInsnNode::Label(label) => {
                layout.label_offsets.insert(label.id, layout.code.len());
            }
            AbstractInsnNode::LineNumber(line) => layout.lines.push(*line),
            AbstractInsnNode::Insn(insn) => emit_insn(
                &mut layout,
                insn,
                cp,
                JumpWidth {
                    node: index,
                    widen: widened.contains(&index),
                },
            )?,
        }
    }
    Ok(layout)
}

/// `start` is the offset the jump is relative to, `at` where it is written.
#[derive(Debug, Clone, Copy)]
struct JumpFixup {
    node: usize,
    start: usize,
    at: usize,
    wide: bool,
    target: LabelNode,
}

#[derive(Debug, Clone, Copy)]
struct SwitchFixup {
    start: usize,
    at: usize,
    target: LabelNode,
}

fn is_wide_jump(opcode: u8) -> bool {
    matches!(opcode, opcodes::GOTO_W | opcodes::JSR_W)
}

/// The conditional jump taken exactly when `opcode` is not.
fn inverse_condition(opcode: u8) -> u8 {
    match opcode {
        opcodes::IFNULL => opcodes::IFNONNULL,
        opcodes::IFNONNULL => opcodes::IFNULL,
        _ if (opcode - opcodes::IFEQ) % 2 == 0 => opcode + 1,
        _ => opcode - 1,
    }
}

#[derive(Debug, Clone, Copy)]
struct JumpWidth {
    node: usize,
    widen: bool,
}

/// Emits a jump. A widened `goto`/`jsr` becomes `goto_w`/`jsr_w`; a widened
/// conditional becomes the inverse condition over a `goto_w`.
fn emit_jump(
    code: &mut Vec<u8>,
    jump_fixups: &mut Vec<JumpFixup>,
    node: &JumpInsnNode,
    width: JumpWidth,
) {
    let start = code.len();
    let opcode = node.insn.opcode;
    let fixup = |start: usize, wide: bool| JumpFixup {
        node: width.node,
        start,
        at: start + 1,
        wide,
        target: node.target,
    };
    if is_wide_jump(opcode) {
        code.push(opcode);
        write_i4(code, 0);
        jump_fixups.push(fixup(start, true));
    } else if !width.widen {
        code.push(opcode);
        write_i2(code, 0);
        jump_fixups.push(fixup(start, false));
    } else if matches!(opcode, opcodes::GOTO | opcodes::JSR) {
        code.push(if opcode == opcodes::GOTO {
            opcodes::GOTO_W
        } else {
            opcodes::JSR_W
        });
        write_i4(code, 0);
        jump_fixups.push(fixup(start, true));
    } else {
        code.push(inverse_condition(opcode));
        write_i2(code, 8);
        let goto = code.len();
        code.push(opcodes::GOTO_W);
        write_i4(code, 0);
        jump_fixups.push(fixup(goto, true));
    }
}

fn emit_insn(
    layout: &mut Layout,
    insn: &Insn,
    cp: &mut ConstantPoolBuilder,
    width: JumpWidth,
) -> Result<(), ClassWriteError> {
    let Layout {
        code,
        jump_fixups,
        switch_fixups,
        ..
    } = layout;
    let start = code.len();
    match insn {
        Insn::Simple(node) => code.push(node.opcode),
        Insn::Int(node) => {
            code.push(node.insn.opcode);
            match node.insn.opcode {
                opcodes::SIPUSH => write_i2(code, node.operand as i16),
                opcodes::NEWARRAY => write_u1(code, node.operand as u8),
                _ => write_i1(code, node.operand as i8),
            }
        }
        Insn::Var(node) => {
            if node.var_index > u8::MAX as u16 {
                code.push(opcodes::WIDE);
                code.push(node.insn.opcode);
                write_u2(code, node.var_index);
            } else {
                code.push(node.insn.opcode);
                write_u1(code, node.var_index as u8);
            }
        }
        Insn::Iinc(node) => {
            if node.var_index > u8::MAX as u16 || i8::try_from(node.increment).is_err() {
                code.push(opcodes::WIDE);
                code.push(opcodes::IINC);
                write_u2(code, node.var_index);
                write_i2(code, node.increment);
            } else {
                code.push(opcodes::IINC);
                write_u1(code, node.var_index as u8);
                write_i1(code, node.increment as i8);
            }
        }
        Insn::Type(node) => {
            code.push(node.insn.opcode);
            let index = match &node.class_ref {
                ClassRef::Index(index) => *index,
                ClassRef::Name(name) => cp.class(name),
            };
            write_u2(code, index);
        }
        Insn::Field(node) => {
            code.push(node.insn.opcode);
            let index = match &node.field_ref {
                MemberRef::Index(index) => *index,
                MemberRef::Symbolic {
                    owner,
                    name,
                    descriptor,
                } => cp.field_ref(owner, name, descriptor),
            };
            write_u2(code, index);
        }
        Insn::Method(node) => {
            code.push(node.insn.opcode);
            let index = match &node.method_ref {
                MemberRef::Index(index) => *index,
                MemberRef::Symbolic {
                    owner,
                    name,
                    descriptor,
                } => cp.method_ref(owner, name, descriptor),
            };
            write_u2(code, index);
        }
        Insn::InvokeInterface(node) => {
            code.push(opcodes::INVOKEINTERFACE);
            let index = match &node.method_ref {
                MemberRef::Index(index) => *index,
                MemberRef::Symbolic {
                    owner,
                    name,
                    descriptor,
                } => cp.interface_method_ref(owner, name, descriptor),
            };
            write_u2(code, index);
            write_u1(code, node.count);
            write_u1(code, 0);
        }
        Insn::InvokeDynamic(node) => {
            code.push(opcodes::INVOKEDYNAMIC);
            write_u2(code, node.method_index);
            write_u2(code, 0);
        }
        Insn::Jump(node) => emit_jump(code, jump_fixups, node, width),
        Insn::Ldc(node) => {
            let (index, wide_only) = match &node.value {
                LdcValue::Index(index) => (*index, node.insn.opcode == opcodes::LDC2_W),
                LdcValue::String(value) => (cp.string(value), false),
                LdcValue::Int(value) => (cp.integer(*value), false),
            };
            if wide_only {
                code.push(opcodes::LDC2_W);
                write_u2(code, index);
            } else if index <= u8::MAX as u16 && node.insn.opcode != opcodes::LDC_W {
                code.push(opcodes::LDC);
                write_u1(code, index as u8);
            } else {
                code.push(opcodes::LDC_W);
                write_u2(code, index);
            }
        }
        Insn::TableSwitch(node) => {
            code.push(opcodes::TABLESWITCH);
            write_switch_padding(code, start);
            switch_fixups.push(SwitchFixup {
                start,
                at: code.len(),
                target: node.default,
            });
            write_i4(code, 0);
            write_i4(code, node.low);
            write_i4(code, node.high);
            for target in &node.targets {
                switch_fixups.push(SwitchFixup {
                    start,
                    at: code.len(),
                    target: *target,
                });
                write_i4(code, 0);
            }
        }
        Insn::LookupSwitch(node) => {
            code.push(opcodes::LOOKUPSWITCH);
            write_switch_padding(code, start);
            switch_fixups.push(SwitchFixup {
                start,
                at: code.len(),
                target: node.default,
            });
            write_i4(code, 0);
            write_i4(code, node.pairs.len() as i32);
            for (key, target) in &node.pairs {
                write_i4(code, *key);
                switch_fixups.push(SwitchFixup {
                    start,
                    at: code.len(),
                    target: *target,
                });
                write_i4(code, 0);
            }
        }
        Insn::MultiANewArray(node) => {
            code.push(opcodes::MULTIANEWARRAY);
            write_u2(code, node.type_index);
            write_u1(code, node.dimensions);
        }
    }
    Ok(())
}

fn write_u1(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

fn write_u2(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_i1(out: &mut Vec<u8>, value: i8) {
    out.push(value as u8);
}

fn write_i2(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_i4(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_i2_at(out: &mut [u8], pos: usize, value: i16) {
    out[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_i4_at(out: &mut [u8], pos: usize, value: i32) {
    out[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
}

fn write_switch_padding(out: &mut Vec<u8>, opcode_offset: usize) {
    let padding = (4 - ((opcode_offset + 1) % 4)) % 4;
    out.extend(std::iter::repeat_n(0, padding));
}

/// Builds a class from scratch: the generated cache classes, and class
/// fixtures in tests.
pub struct ClassBuilder {
    minor_version: u16,
    major_version: u16,
    access_flags: u16,
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    fields: Vec<FieldBuilder>,
    methods: Vec<MethodBuilder>,
    source_file: Option<String>,
}

impl ClassBuilder {
    pub fn new(name: &str, super_name: &str) -> Self {
        Self {
            minor_version: 0,
            major_version: constants::V1_8,
            access_flags: constants::ACC_PUBLIC | constants::ACC_SUPER,
            name: name.to_string(),
            super_name: Some(super_name.to_string()),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            source_file: None,
        }
    }

    pub fn version(&mut self, major: u16, minor: u16) -> &mut Self {
        self.major_version = major;
        self.minor_version = minor;
        self
    }

    pub fn access_flags(&mut self, flags: u16) -> &mut Self {
        self.access_flags = flags;
        self
    }

    pub fn add_interface(&mut self, name: &str) -> &mut Self {
        self.interfaces.push(name.to_string());
        self
    }

    pub fn add_field(&mut self, field: FieldBuilder) -> &mut Self {
        self.fields.push(field);
        self
    }

    pub fn add_method(&mut self, method: MethodBuilder) -> &mut Self {
        self.methods.push(method);
        self
    }

    pub fn source_file(&mut self, name: &str) -> &mut Self {
        self.source_file = Some(name.to_string());
        self
    }

    /// Assembles every method and computes its maxs and, from class version
    /// 50 on, its `StackMapTable`.
    pub fn build(self, hierarchy: &dyn ClassHierarchy) -> Result<ClassFile, ClassWriteError> {
        let mut cp = ConstantPoolBuilder::new();
        let this_class = cp.class(&self.name);
        let super_class = match self.super_name.as_deref() {
            Some(name) => cp.class(name),
            None => 0,
        };
        let interfaces = self.interfaces.iter().map(|name| cp.class(name)).collect();

        let fields = self
            .fields
            .iter()
            .map(|field| FieldInfo {
                access_flags: field.access_flags,
                name_index: cp.utf8(&field.name),
                descriptor_index: cp.utf8(&field.descriptor),
                attributes: Vec::new(),
            })
            .collect();

        let overlay = Overlay::new(
            ClassInfo {
                name: self.name.clone(),
                super_name: self.super_name.clone(),
                interfaces: self.interfaces.clone(),
                is_interface: self.access_flags & constants::ACC_INTERFACE != 0,
            },
            hierarchy,
        );
        let mut methods = Vec::with_capacity(self.methods.len());
        for method in &self.methods {
            let mut attributes = Vec::new();
            if let Some(body) = &method.body {
                let mut code = assemble(body, &mut cp)?;
                frames::recompute(
                    &FrameMethod {
                        class_name: &self.name,
                        access_flags: method.access_flags,
                        name: &method.name,
                        descriptor: &method.descriptor,
                    },
                    &mut code,
                    &mut cp,
                    &overlay,
                    self.major_version,
                )?;
                attributes.push(AttributeInfo::Code(code));
            }
            methods.push(MethodInfo {
                access_flags: method.access_flags,
                name_index: cp.utf8(&method.name),
                descriptor_index: cp.utf8(&method.descriptor),
                attributes,
            });
        }

        let mut attributes = Vec::new();
        if let Some(source_file) = &self.source_file {
            attributes.push(AttributeInfo::SourceFile {
                sourcefile_index: cp.utf8(source_file),
            });
        }
        let (constant_pool, bootstrap_methods) = cp.finish()?;
        if !bootstrap_methods.is_empty() {
            attributes.push(AttributeInfo::BootstrapMethods {
                methods: bootstrap_methods,
            });
        }

        Ok(ClassFile {
            minor_version: self.minor_version,
            major_version: self.major_version,
            constant_pool,
            access_flags: self.access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }
}

pub struct FieldBuilder {
    access_flags: u16,
    name: String,
    descriptor: String,
}

impl FieldBuilder {
    pub fn new(access_flags: u16, name: &str, descriptor: &str) -> Self {
        Self {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

pub struct MethodBuilder {
    access_flags: u16,
    name: String,
    descriptor: String,
    body: Option<MethodBody>,
}

impl MethodBuilder {
    pub fn new(access_flags: u16, name: &str, descriptor: &str) -> Self {
        Self {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            body: None,
        }
    }

    pub fn code<T: Into<NodeList>>(&mut self, instructions: T) -> &mut Self {
        self.body_mut().instructions = instructions.into();
        self
    }

    fn body_mut(&mut self) -> &mut MethodBody {
        self.body.get_or_insert_with(|| MethodBody {
            instructions: NodeList::new(),
            try_catch_blocks: Vec::new(),
            local_variables: Vec::new(),
            local_variable_types: Vec::new(),
            max_stack: 0,
            max_locals: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_reader::{decode_instructions, read_class_file};
    use crate::class_writer::write_class_file;
    use crate::hierarchy::BootstrapClasses;
    use crate::insn::{InsnList, InsnNode, JumpInsnNode, TryCatchBlockNode};

    #[test]
    fn test_constant_pool_deduplication() {
        let mut cp = ConstantPoolBuilder::new();
        let first = cp.method_ref("java/lang/Object", "<init>", "()V");
        let second = cp.method_ref("java/lang/Object", "<init>", "()V");
        assert_eq!(first, second);
        assert_eq!(cp.class("java/lang/Object"), cp.class("java/lang/Object"));
        assert_ne!(
            cp.interface_method_ref("java/lang/Object", "<init>", "()V"),
            first
        );
    }

    #[test]
    fn test_from_pool_only_appends() {
        let mut cp = ConstantPoolBuilder::new();
        let object = cp.class("java/lang/Object");
        let answer = cp.integer(42);
        let bsm = cp.bootstrap_method(1, vec![2]);
        let (pool, bootstrap_methods) = cp.finish().unwrap();
        let original_len = pool.len();

        let mut cp = ConstantPoolBuilder::from_pool(pool.clone(), bootstrap_methods);
        assert_eq!(cp.class("java/lang/Object"), object);
        assert_eq!(cp.integer(42), answer);
        assert_eq!(cp.bootstrap_method(1, vec![2]), bsm);
        let added = cp.class("java/lang/String");
        assert_eq!(added as usize, original_len + 1);
        let (extended, _) = cp.finish().unwrap();
        assert_eq!(&extended[..original_len], &pool[..]);
    }

    #[test]
    fn test_pool_overflow_is_reported() {
        let mut cp = ConstantPoolBuilder::new();
        for value in 0..u16::MAX as i32 {
            cp.integer(value);
        }
        assert!(matches!(
            cp.finish(),
            Err(ClassWriteError::ConstantPoolOverflow(_))
        ));
    }

    #[test]
    fn test_assemble_resolves_labels_and_widens_locals() {
        let mut list = insn_list! {
            [label 0]
            [line 7, 0]
            [var ILOAD 300]
            [jump IFEQ 1]
            [iinc IINC 2, 1000]
            [label 1]
            [RETURN]
        };
        list.add(LabelNode { id: 2 });
        let body = MethodBody {
            instructions: list,
            try_catch_blocks: vec![TryCatchBlockNode {
                start: LabelNode { id: 0 },
                end: LabelNode { id: 1 },
                handler: LabelNode { id: 1 },
                catch_type: 0,
            }],
            local_variables: Vec::new(),
            local_variable_types: Vec::new(),
            max_stack: 1,
            max_locals: 301,
        };
        let mut cp = ConstantPoolBuilder::new();
        let code = assemble(&body, &mut cp).unwrap();
        // wide iload (4) + ifeq (3) + wide iinc (6) + return (1)
        assert_eq!(code.code.len(), 14);
        assert_eq!(code.code[0], opcodes::WIDE);
        let insns = decode_instructions(&code.code).unwrap();
        match &insns[1].1 {
            Insn::Jump(node) => assert_eq!(node.target, LabelNode { id: 13 }),
            other => panic!("expected jump, got {other:?}"),
        }
        assert_eq!(code.exception_table[0].end_pc, 13);
        assert!(matches!(
            &code.attributes[0],
            AttributeInfo::LineNumberTable { entries } if entries[0].line_number == 7
        ));
    }

    #[test]
    fn test_unresolved_label() {
        let mut list = NodeList::new();
        list.add(Insn::Jump(JumpInsnNode {
            insn: InsnNode {
                opcode: opcodes::GOTO,
            },
            target: LabelNode { id: 99 },
        }));
        let body = body_of(list);
        let mut cp = ConstantPoolBuilder::new();
        assert!(matches!(
            assemble(&body, &mut cp),
            Err(ClassWriteError::UnresolvedLabel(99))
        ));
    }

    fn body_of(instructions: NodeList) -> MethodBody {
        MethodBody {
            instructions,
            try_catch_blocks: Vec::new(),
            local_variables: Vec::new(),
            local_variable_types: Vec::new(),
            max_stack: 1,
            max_locals: 1,
        }
    }

    fn nops(count: usize) -> InsnList {
        let mut padding = InsnList::new();
        for _ in 0..count {
            padding.add(InsnNode {
                opcode: opcodes::NOP,
            });
        }
        padding
    }

    #[test]
    fn test_far_goto_becomes_goto_w() {
        let mut list = insn_list! {
            [jump GOTO 1]
        };
        list.extend(nops(40_000));
        list.append(insn_list! {
            [label 1]
            [RETURN]
        });
        let mut cp = ConstantPoolBuilder::new();
        let code = assemble(&body_of(list), &mut cp).unwrap().code;

        assert_eq!(code.len(), 5 + 40_000 + 1);
        assert_eq!(code[0], opcodes::GOTO_W);
        assert_eq!(i32::from_be_bytes([code[1], code[2], code[3], code[4]]), 40_005);
    }

    #[test]
    fn test_far_conditional_jumps_over_goto_w() {
        let mut list = insn_list! {
            [label 0]
            [var ILOAD 0]
            [jump IFEQ 1]
            [jump IFNULL 0]
        };
        list.extend(nops(40_000));
        list.append(insn_list! {
            [label 1]
            [RETURN]
        });
        let mut cp = ConstantPoolBuilder::new();
        let code = assemble(&body_of(list), &mut cp).unwrap().code;

        let insns = decode_instructions(&code).unwrap();
        let jumps: Vec<(usize, u8, usize)> = insns
            .iter()
            .filter_map(|(offset, insn)| match insn {
                Insn::Jump(node) => Some((*offset, node.insn.opcode, node.target.id)),
                _ => None,
            })
            .collect();
        // ifne +8 skips the goto_w; the backward ifnull still fits
        assert_eq!(
            jumps,
            vec![
                (2, opcodes::IFNE, 10),
                (5, opcodes::GOTO_W, 40_013),
                (10, opcodes::IFNULL, 0),
            ]
        );
        assert_eq!(insns.last().map(|(offset, _)| *offset), Some(40_013));
        assert_eq!(i32::from_be_bytes([code[6], code[7], code[8], code[9]]), 40_008);
    }

    #[test]
    fn test_built_class_round_trips() {
        let mut class = ClassBuilder::new("com/example/Built", "java/lang/Object");
        class.source_file("Built.java");
        let mut init = MethodBuilder::new(constants::ACC_PUBLIC, "<init>", "()V");
        init.code(insn_list! {
            [var ALOAD 0]
            [method INVOKESPECIAL "java/lang/Object", "<init>", "()V"]
            [RETURN]
        });
        class.add_method(init);
        class.add_field(FieldBuilder::new(
            constants::ACC_STATIC,
            "count",
            "I",
        ));
        let class_file = class.build(&BootstrapClasses).unwrap();
        let bytes = write_class_file(&class_file).unwrap();
        let parsed = read_class_file(&bytes).unwrap();
        assert_eq!(parsed.this_class_name().unwrap(), "com/example/Built");
        assert_eq!(parsed.source_file().unwrap(), Some("Built.java"));
        let code = parsed.methods[0].code().unwrap();
        assert_eq!(code.max_stack, 1);
        assert_eq!(code.max_locals, 1);
        assert_eq!(parsed.fields.len(), 1);
    }
}
