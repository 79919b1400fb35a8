//! `max_stack`, `max_locals` and `StackMapTable` for assembled code.
//!
//! A worklist dataflow runs over the decoded instructions. Joins merge
//! reference types through [`ClassHierarchy`], so a class that cannot be
//! resolved fails the computation instead of degrading to `Object`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::builder::ConstantPoolBuilder;
use crate::class_reader::{
    AttributeInfo, CodeAttribute, CpInfo, StackMapFrame, VerificationTypeInfo, cp_class_name,
    cp_invoke_dynamic, cp_member_ref, cp_name_and_type, decode_instructions,
};
use crate::constants::{self, JAVA_LANG_OBJECT, JAVA_LANG_STRING, JAVA_LANG_THROWABLE};
use crate::descriptor::{FieldType, parse_field_descriptor, parse_method_descriptor};
use crate::error::{ClassWriteError, HierarchyError};
use crate::hierarchy::{ClassHierarchy, common_superclass};
use crate::insn::{ClassRef, Insn, LdcValue, MemberRef};
use crate::opcodes;

/// The method whose code is analysed.
#[derive(Debug, Clone, Copy)]
pub struct FrameMethod<'a> {
    pub class_name: &'a str,
    pub access_flags: u16,
    pub name: &'a str,
    pub descriptor: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FrameType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    Object(String),
    Uninitialized(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FrameState {
    locals: Vec<FrameType>,
    stack: Vec<FrameType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub max_stack: u16,
    pub max_locals: u16,
    pub frames: Vec<StackMapFrame>,
}

/// Recomputes the maxs of `code` and replaces its `StackMapTable`.
/// `max_locals` never shrinks below the value already recorded.
pub fn recompute(
    method: &FrameMethod<'_>,
    code: &mut CodeAttribute,
    cp: &mut ConstantPoolBuilder,
    hierarchy: &dyn ClassHierarchy,
    major_version: u16,
) -> Result<(), ClassWriteError> {
    let analysis = analyze(method, code, cp, hierarchy, major_version >= constants::V1_6)?;
    code.max_stack = analysis.max_stack;
    code.max_locals = code.max_locals.max(analysis.max_locals);
    code.attributes
        .retain(|attr| !matches!(attr, AttributeInfo::StackMapTable { .. }));
    if !analysis.frames.is_empty() {
        code.attributes.push(AttributeInfo::StackMapTable {
            entries: analysis.frames,
        });
    }
    Ok(())
}

pub fn analyze(
    method: &FrameMethod<'_>,
    code: &CodeAttribute,
    cp: &mut ConstantPoolBuilder,
    hierarchy: &dyn ClassHierarchy,
    with_frames: bool,
) -> Result<Analysis, ClassWriteError> {
    let initial = initial_frame(method)?;
    let insns = decode_instructions(&code.code)?;
    if insns.is_empty() {
        return Ok(Analysis {
            max_stack: 0,
            max_locals: initial.locals.len() as u16,
            frames: Vec::new(),
        });
    }
    let code_end = code.code.len();
    let insn_index: HashMap<usize, usize> = insns
        .iter()
        .enumerate()
        .map(|(index, (offset, _))| (*offset, index))
        .collect();
    let handlers = build_exception_handlers(code, cp.pool(), hierarchy)?;

    let mut frames: HashMap<usize, FrameState> = HashMap::new();
    let mut worklist = VecDeque::new();
    let mut queued = HashSet::new();
    frames.insert(0, initial.clone());
    worklist.push_back(0usize);
    queued.insert(0usize);

    let mut max_stack = 0usize;
    let mut max_locals = initial.locals.len();
    let limit = insns.len() * 100 + 10_000;
    let mut iterations = 0usize;
    while let Some(offset) = worklist.pop_front() {
        queued.remove(&offset);
        iterations += 1;
        if iterations > limit {
            return Err(ClassWriteError::FrameComputation(
                "frame analysis exceeded iteration limit".to_string(),
            ));
        }
        let index = *insn_index.get(&offset).ok_or_else(|| {
            ClassWriteError::FrameComputation(format!("missing instruction at {offset}"))
        })?;
        let insn = &insns[index].1;
        let next = insns.get(index + 1).map_or(code_end, |(next, _)| *next);
        let frame = frames.get(&offset).cloned().ok_or_else(|| {
            ClassWriteError::FrameComputation(format!("missing frame at {offset}"))
        })?;

        let out_frame = execute_instruction(offset, insn, &frame, method.class_name, cp.pool())?;
        max_stack = max_stack
            .max(stack_slots(&frame.stack))
            .max(stack_slots(&out_frame.stack));
        max_locals = max_locals.max(frame.locals.len()).max(out_frame.locals.len());

        for successor in instruction_successors(offset, next, insn)? {
            if successor >= code_end {
                return Err(ClassWriteError::FrameComputation(format!(
                    "execution falls off the end of the code after {offset}"
                )));
            }
            merge_into(&mut frames, &mut worklist, &mut queued, successor, &out_frame, hierarchy)?;
        }

        for handler in handlers.iter().filter(|handler| handler.covers(offset)) {
            max_stack = max_stack.max(1);
            for locals in [&frame.locals, &out_frame.locals] {
                let handler_frame = FrameState {
                    locals: locals.clone(),
                    stack: vec![handler.exception_type.clone()],
                };
                merge_into(
                    &mut frames,
                    &mut worklist,
                    &mut queued,
                    handler.handler_pc,
                    &handler_frame,
                    hierarchy,
                )?;
            }
        }
    }

    let frames = if with_frames {
        let required = frame_offsets(&insns, code_end, &frames, &handlers);
        encode_frames(&required, &frames, &initial, cp)?
    } else {
        Vec::new()
    };

    Ok(Analysis {
        max_stack: max_stack as u16,
        max_locals: max_locals as u16,
        frames,
    })
}

fn merge_into(
    frames: &mut HashMap<usize, FrameState>,
    worklist: &mut VecDeque<usize>,
    queued: &mut HashSet<usize>,
    target: usize,
    incoming: &FrameState,
    hierarchy: &dyn ClassHierarchy,
) -> Result<(), ClassWriteError> {
    let next = match frames.get(&target) {
        None => incoming.clone(),
        Some(existing) => {
            let merged = merge_frame(existing, incoming, target, hierarchy)?;
            if merged == *existing {
                return Ok(());
            }
            merged
        }
    };
    frames.insert(target, next);
    if queued.insert(target) {
        worklist.push_back(target);
    }
    Ok(())
}

fn merge_frame(
    existing: &FrameState,
    incoming: &FrameState,
    target: usize,
    hierarchy: &dyn ClassHierarchy,
) -> Result<FrameState, ClassWriteError> {
    if existing.stack.len() != incoming.stack.len() {
        return Err(ClassWriteError::FrameComputation(format!(
            "inconsistent stack height at {target}"
        )));
    }
    Ok(FrameState {
        locals: merge_vec(&existing.locals, &incoming.locals, hierarchy)?,
        stack: merge_vec(&existing.stack, &incoming.stack, hierarchy)?,
    })
}

fn merge_vec(
    a: &[FrameType],
    b: &[FrameType],
    hierarchy: &dyn ClassHierarchy,
) -> Result<Vec<FrameType>, HierarchyError> {
    let len = a.len().max(b.len());
    let mut merged = Vec::with_capacity(len);
    for i in 0..len {
        let left = a.get(i).unwrap_or(&FrameType::Top);
        let right = b.get(i).unwrap_or(&FrameType::Top);
        merged.push(merge_type(left, right, hierarchy)?);
    }
    Ok(merged)
}

fn merge_type(
    a: &FrameType,
    b: &FrameType,
    hierarchy: &dyn ClassHierarchy,
) -> Result<FrameType, HierarchyError> {
    if a == b {
        return Ok(a.clone());
    }
    Ok(match (a, b) {
        (FrameType::Null, FrameType::Object(name)) | (FrameType::Object(name), FrameType::Null) => {
            FrameType::Object(name.clone())
        }
        (FrameType::Object(left), FrameType::Object(right)) => {
            FrameType::Object(common_superclass(hierarchy, left, right)?)
        }
        _ => FrameType::Top,
    })
}

/// Offsets that need an explicit frame: branch and switch targets, handler
/// entries, and whatever follows an unconditional transfer.
fn frame_offsets(
    insns: &[(usize, Insn)],
    code_end: usize,
    frames: &HashMap<usize, FrameState>,
    handlers: &[ExceptionHandlerInfo],
) -> BTreeSet<usize> {
    let mut required = BTreeSet::new();
    for (index, (offset, insn)) in insns.iter().enumerate() {
        if !frames.contains_key(offset) {
            continue;
        }
        let next = insns.get(index + 1).map_or(code_end, |(next, _)| *next);
        match insn {
            Insn::Jump(node) => {
                required.insert(node.target.id);
                if matches!(node.insn.opcode, opcodes::GOTO | opcodes::GOTO_W) {
                    required.insert(next);
                }
            }
            Insn::TableSwitch(node) => {
                required.insert(node.default.id);
                required.extend(node.targets.iter().map(|label| label.id));
                required.insert(next);
            }
            Insn::LookupSwitch(node) => {
                required.insert(node.default.id);
                required.extend(node.pairs.iter().map(|(_, label)| label.id));
                required.insert(next);
            }
            Insn::Simple(node)
                if matches!(
                    node.opcode,
                    opcodes::IRETURN..=opcodes::RETURN | opcodes::ATHROW
                ) =>
            {
                required.insert(next);
            }
            _ => {}
        }
    }
    required.extend(handlers.iter().map(|handler| handler.handler_pc));
    required.remove(&code_end);
    required
}

fn encode_frames(
    required: &BTreeSet<usize>,
    frames: &HashMap<usize, FrameState>,
    initial: &FrameState,
    cp: &mut ConstantPoolBuilder,
) -> Result<Vec<StackMapFrame>, ClassWriteError> {
    let mut result = Vec::with_capacity(required.len());
    let mut previous_locals = compact_locals(&initial.locals);
    let mut previous_offset: Option<usize> = None;
    for &offset in required {
        let frame = frames.get(&offset).ok_or_else(|| {
            ClassWriteError::FrameComputation(format!("unreachable code at {offset}"))
        })?;
        let locals = compact_locals(&frame.locals);
        let offset_delta = match previous_offset {
            None => offset,
            Some(previous) => offset - previous - 1,
        } as u16;
        result.push(compress_frame(
            offset_delta,
            &previous_locals,
            &locals,
            &frame.stack,
            cp,
        ));
        previous_locals = locals;
        previous_offset = Some(offset);
    }
    Ok(result)
}

fn compress_frame(
    offset_delta: u16,
    previous: &[FrameType],
    locals: &[FrameType],
    stack: &[FrameType],
    cp: &mut ConstantPoolBuilder,
) -> StackMapFrame {
    if locals == previous {
        match stack {
            [] if offset_delta <= 63 => return StackMapFrame::SameFrame { offset_delta },
            [] => return StackMapFrame::SameFrameExtended { offset_delta },
            [item] if offset_delta <= 63 => {
                return StackMapFrame::SameLocals1StackItemFrame {
                    offset_delta,
                    stack: to_verification_type(item, cp),
                };
            }
            [item] => {
                return StackMapFrame::SameLocals1StackItemFrameExtended {
                    offset_delta,
                    stack: to_verification_type(item, cp),
                };
            }
            _ => {}
        }
    } else if stack.is_empty() {
        if locals.len() < previous.len()
            && previous.len() - locals.len() <= 3
            && previous.starts_with(locals)
        {
            return StackMapFrame::ChopFrame {
                offset_delta,
                k: (previous.len() - locals.len()) as u8,
            };
        }
        if locals.len() > previous.len()
            && locals.len() - previous.len() <= 3
            && locals.starts_with(previous)
        {
            return StackMapFrame::AppendFrame {
                offset_delta,
                locals: locals[previous.len()..]
                    .iter()
                    .map(|value| to_verification_type(value, cp))
                    .collect(),
            };
        }
    }
    StackMapFrame::FullFrame {
        offset_delta,
        locals: locals
            .iter()
            .map(|value| to_verification_type(value, cp))
            .collect(),
        stack: stack
            .iter()
            .map(|value| to_verification_type(value, cp))
            .collect(),
    }
}

fn stack_slots(stack: &[FrameType]) -> usize {
    stack
        .iter()
        .map(|value| if is_category2(value) { 2 } else { 1 })
        .sum()
}

/// Drops the implicit second slot of longs and doubles and trailing `Top`s,
/// which is how frames list locals.
fn compact_locals(locals: &[FrameType]) -> Vec<FrameType> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < locals.len() {
        out.push(locals[i].clone());
        if is_category2(&locals[i]) && matches!(locals.get(i + 1), Some(FrameType::Top)) {
            i += 1;
        }
        i += 1;
    }
    while matches!(out.last(), Some(FrameType::Top)) {
        out.pop();
    }
    out
}

fn to_verification_type(value: &FrameType, cp: &mut ConstantPoolBuilder) -> VerificationTypeInfo {
    match value {
        FrameType::Top => VerificationTypeInfo::Top,
        FrameType::Integer => VerificationTypeInfo::Integer,
        FrameType::Float => VerificationTypeInfo::Float,
        FrameType::Long => VerificationTypeInfo::Long,
        FrameType::Double => VerificationTypeInfo::Double,
        FrameType::Null => VerificationTypeInfo::Null,
        FrameType::UninitializedThis => VerificationTypeInfo::UninitializedThis,
        FrameType::Uninitialized(offset) => VerificationTypeInfo::Uninitialized { offset: *offset },
        FrameType::Object(name) => VerificationTypeInfo::Object {
            cpool_index: cp.class(name),
        },
    }
}

fn initial_frame(method: &FrameMethod<'_>) -> Result<FrameState, ClassWriteError> {
    let mut locals = Vec::new();
    if method.access_flags & constants::ACC_STATIC == 0 {
        if method.name == "<init>" && method.class_name != JAVA_LANG_OBJECT {
            locals.push(FrameType::UninitializedThis);
        } else {
            locals.push(FrameType::Object(method.class_name.to_string()));
        }
    }
    let (params, _) = parse_method_descriptor(method.descriptor)?;
    for param in params {
        let is_wide = param.size() == 2;
        locals.push(field_type_to_frame(param));
        if is_wide {
            locals.push(FrameType::Top);
        }
    }
    Ok(FrameState {
        locals,
        stack: Vec::new(),
    })
}

#[derive(Debug, Clone)]
struct ExceptionHandlerInfo {
    start_pc: usize,
    end_pc: usize,
    handler_pc: usize,
    exception_type: FrameType,
}

impl ExceptionHandlerInfo {
    fn covers(&self, offset: usize) -> bool {
        offset >= self.start_pc && offset < self.end_pc
    }
}

/// One entry per exception table row; rows sharing a handler get the common
/// superclass of all their catch types.
fn build_exception_handlers(
    code: &CodeAttribute,
    cp: &[CpInfo],
    hierarchy: &dyn ClassHierarchy,
) -> Result<Vec<ExceptionHandlerInfo>, ClassWriteError> {
    let mut handler_types: HashMap<usize, String> = HashMap::new();
    let mut handlers = Vec::with_capacity(code.exception_table.len());
    for entry in &code.exception_table {
        let catch_type = if entry.catch_type == 0 {
            JAVA_LANG_THROWABLE
        } else {
            cp_class_name(cp, entry.catch_type)?
        };
        let handler_pc = entry.handler_pc as usize;
        let merged = match handler_types.get(&handler_pc) {
            Some(existing) => common_superclass(hierarchy, existing, catch_type)?,
            None => catch_type.to_string(),
        };
        handler_types.insert(handler_pc, merged);
        handlers.push(ExceptionHandlerInfo {
            start_pc: entry.start_pc as usize,
            end_pc: entry.end_pc as usize,
            handler_pc,
            exception_type: FrameType::Top,
        });
    }
    for handler in &mut handlers {
        if let Some(name) = handler_types.get(&handler.handler_pc) {
            handler.exception_type = FrameType::Object(name.clone());
        }
    }
    Ok(handlers)
}

fn instruction_successors(offset: usize, next: usize, insn: &Insn) -> Result<Vec<usize>, ClassWriteError> {
    let successors = match insn {
        Insn::Jump(node) => match node.insn.opcode {
            opcodes::GOTO | opcodes::GOTO_W => vec![node.target.id],
            opcodes::JSR | opcodes::JSR_W => return Err(jsr_unsupported(offset)),
            _ => vec![node.target.id, next],
        },
        Insn::Var(node) if node.insn.opcode == opcodes::RET => return Err(jsr_unsupported(offset)),
        Insn::TableSwitch(node) => std::iter::once(node.default.id)
            .chain(node.targets.iter().map(|label| label.id))
            .collect(),
        Insn::LookupSwitch(node) => std::iter::once(node.default.id)
            .chain(node.pairs.iter().map(|(_, label)| label.id))
            .collect(),
        Insn::Simple(node)
            if matches!(
                node.opcode,
                opcodes::IRETURN..=opcodes::RETURN | opcodes::ATHROW
            ) =>
        {
            Vec::new()
        }
        _ => vec![next],
    };
    Ok(successors)
}

fn jsr_unsupported(offset: usize) -> ClassWriteError {
    ClassWriteError::FrameComputation(format!("jsr/ret not supported at {offset}"))
}

fn execute_instruction(
    offset: usize,
    insn: &Insn,
    frame: &FrameState,
    class_name: &str,
    cp: &[CpInfo],
) -> Result<FrameState, ClassWriteError> {
    let mut locals = frame.locals.clone();
    let mut stack = frame.stack.clone();

    let pop = |stack: &mut Vec<FrameType>| {
        stack.pop().ok_or_else(|| {
            ClassWriteError::FrameComputation(format!("stack underflow at {offset}"))
        })
    };

    match insn {
        Insn::Simple(node) => execute_simple(node.opcode, offset, &mut locals, &mut stack)?,
        Insn::Int(node) => {
            if node.insn.opcode == opcodes::NEWARRAY {
                pop(&mut stack)?;
                let desc = newarray_descriptor(node.operand as u8)?;
                stack.push(FrameType::Object(desc.to_string()));
            } else {
                stack.push(FrameType::Integer);
            }
        }
        Insn::Var(node) => match node.insn.opcode {
            opcodes::ILOAD..=opcodes::ALOAD => stack.push(load_local(&locals, node.var_index)),
            opcodes::ISTORE..=opcodes::ASTORE => {
                let value = pop(&mut stack)?;
                store_local(&mut locals, node.var_index, value);
            }
            _ => return Err(jsr_unsupported(offset)),
        },
        Insn::Iinc(_) => {}
        Insn::Type(node) => {
            let name = match &node.class_ref {
                ClassRef::Index(index) => cp_class_name(cp, *index)?,
                ClassRef::Name(name) => name.as_str(),
            };
            match node.insn.opcode {
                opcodes::NEW => stack.push(FrameType::Uninitialized(offset as u16)),
                opcodes::ANEWARRAY => {
                    pop(&mut stack)?;
                    let desc = if name.starts_with('[') {
                        format!("[{name}")
                    } else {
                        format!("[L{name};")
                    };
                    stack.push(FrameType::Object(desc));
                }
                opcodes::CHECKCAST => {
                    pop(&mut stack)?;
                    stack.push(FrameType::Object(name.to_string()));
                }
                _ => {
                    pop(&mut stack)?;
                    stack.push(FrameType::Integer);
                }
            }
        }
        Insn::Field(node) => {
            let (_, _, descriptor) = member(&node.field_ref, cp)?;
            let ty = field_type_to_frame(parse_field_descriptor(descriptor)?);
            match node.insn.opcode {
                opcodes::GETSTATIC => stack.push(ty),
                opcodes::PUTSTATIC => {
                    pop(&mut stack)?;
                }
                opcodes::GETFIELD => {
                    pop(&mut stack)?;
                    stack.push(ty);
                }
                _ => {
                    pop(&mut stack)?;
                    pop(&mut stack)?;
                }
            }
        }
        Insn::Method(node) => {
            let (owner, name, descriptor) = member(&node.method_ref, cp)?;
            let receiver = node.insn.opcode != opcodes::INVOKESTATIC;
            execute_invoke(
                offset, owner, name, descriptor, receiver, class_name, &mut locals, &mut stack,
            )?;
        }
        Insn::InvokeInterface(node) => {
            let (owner, name, descriptor) = member(&node.method_ref, cp)?;
            execute_invoke(
                offset, owner, name, descriptor, true, class_name, &mut locals, &mut stack,
            )?;
        }
        Insn::InvokeDynamic(node) => {
            let (name, descriptor) = cp_invoke_dynamic(cp, node.method_index)?;
            execute_invoke(
                offset, "", name, descriptor, false, class_name, &mut locals, &mut stack,
            )?;
        }
        Insn::Jump(node) => match node.insn.opcode {
            opcodes::IFEQ..=opcodes::IFLE | opcodes::IFNULL | opcodes::IFNONNULL => {
                pop(&mut stack)?;
            }
            opcodes::IF_ICMPEQ..=opcodes::IF_ACMPNE => {
                pop(&mut stack)?;
                pop(&mut stack)?;
            }
            opcodes::GOTO | opcodes::GOTO_W => {}
            _ => return Err(jsr_unsupported(offset)),
        },
        Insn::Ldc(node) => stack.push(ldc_type(&node.value, cp, offset)?),
        Insn::TableSwitch(_) | Insn::LookupSwitch(_) => {
            pop(&mut stack)?;
        }
        Insn::MultiANewArray(node) => {
            for _ in 0..node.dimensions {
                pop(&mut stack)?;
            }
            let desc = cp_class_name(cp, node.type_index)?;
            stack.push(FrameType::Object(desc.to_string()));
        }
    }

    Ok(FrameState { locals, stack })
}

fn execute_simple(
    opcode: u8,
    offset: usize,
    locals: &mut Vec<FrameType>,
    stack: &mut Vec<FrameType>,
) -> Result<(), ClassWriteError> {
    let pop = |stack: &mut Vec<FrameType>| {
        stack.pop().ok_or_else(|| {
            ClassWriteError::FrameComputation(format!("stack underflow at {offset}"))
        })
    };

    match opcode {
        opcodes::NOP => {}
        opcodes::ACONST_NULL => stack.push(FrameType::Null),
        opcodes::ICONST_M1..=opcodes::ICONST_5 => stack.push(FrameType::Integer),
        opcodes::LCONST_0 | opcodes::LCONST_1 => stack.push(FrameType::Long),
        opcodes::FCONST_0..=opcodes::FCONST_2 => stack.push(FrameType::Float),
        opcodes::DCONST_0 | opcodes::DCONST_1 => stack.push(FrameType::Double),
        opcodes::ILOAD_0..=opcodes::ALOAD_3 => {
            let index = ((opcode - opcodes::ILOAD_0) % 4) as u16;
            stack.push(load_local(locals, index));
        }
        opcodes::IALOAD..=opcodes::SALOAD => {
            pop(stack)?;
            let array_ref = pop(stack)?;
            let ty = match opcode {
                opcodes::LALOAD => FrameType::Long,
                opcodes::FALOAD => FrameType::Float,
                opcodes::DALOAD => FrameType::Double,
                opcodes::AALOAD => array_element_type(&array_ref)
                    .unwrap_or_else(|| FrameType::Object(JAVA_LANG_OBJECT.to_string())),
                _ => FrameType::Integer,
            };
            stack.push(ty);
        }
        opcodes::ISTORE_0..=opcodes::ASTORE_3 => {
            let value = pop(stack)?;
            store_local(locals, ((opcode - opcodes::ISTORE_0) % 4) as u16, value);
        }
        opcodes::IASTORE..=opcodes::SASTORE => {
            pop(stack)?;
            pop(stack)?;
            pop(stack)?;
        }
        opcodes::POP => {
            pop(stack)?;
        }
        opcodes::POP2 => {
            let v1 = pop(stack)?;
            if !is_category2(&v1) {
                pop(stack)?;
            }
        }
        opcodes::DUP => {
            let v1 = pop(stack)?;
            stack.push(v1.clone());
            stack.push(v1);
        }
        opcodes::DUP_X1 => {
            let v1 = pop(stack)?;
            let v2 = pop(stack)?;
            stack.push(v1.clone());
            stack.push(v2);
            stack.push(v1);
        }
        opcodes::DUP_X2 => {
            let v1 = pop(stack)?;
            let v2 = pop(stack)?;
            if is_category2(&v2) {
                stack.push(v1.clone());
                stack.push(v2);
                stack.push(v1);
            } else {
                let v3 = pop(stack)?;
                stack.push(v1.clone());
                stack.push(v3);
                stack.push(v2);
                stack.push(v1);
            }
        }
        opcodes::DUP2 => {
            let v1 = pop(stack)?;
            if is_category2(&v1) {
                stack.push(v1.clone());
                stack.push(v1);
            } else {
                let v2 = pop(stack)?;
                stack.push(v2.clone());
                stack.push(v1.clone());
                stack.push(v2);
                stack.push(v1);
            }
        }
        opcodes::DUP2_X1 => {
            let v1 = pop(stack)?;
            let v2 = pop(stack)?;
            if is_category2(&v1) {
                stack.push(v1.clone());
                stack.push(v2);
                stack.push(v1);
            } else {
                let v3 = pop(stack)?;
                stack.push(v2.clone());
                stack.push(v1.clone());
                stack.push(v3);
                stack.push(v2);
                stack.push(v1);
            }
        }
        opcodes::DUP2_X2 => {
            let v1 = pop(stack)?;
            let v2 = pop(stack)?;
            match (is_category2(&v1), is_category2(&v2)) {
                (true, true) => {
                    stack.push(v1.clone());
                    stack.push(v2);
                    stack.push(v1);
                }
                (true, false) => {
                    let v3 = pop(stack)?;
                    stack.push(v1.clone());
                    stack.push(v3);
                    stack.push(v2);
                    stack.push(v1);
                }
                (false, _) => {
                    let v3 = pop(stack)?;
                    if is_category2(&v3) {
                        stack.push(v2.clone());
                        stack.push(v1.clone());
                        stack.push(v3);
                        stack.push(v2);
                        stack.push(v1);
                    } else {
                        let v4 = pop(stack)?;
                        stack.push(v2.clone());
                        stack.push(v1.clone());
                        stack.push(v4);
                        stack.push(v3);
                        stack.push(v2);
                        stack.push(v1);
                    }
                }
            }
        }
        opcodes::SWAP => {
            let v1 = pop(stack)?;
            let v2 = pop(stack)?;
            stack.push(v1);
            stack.push(v2);
        }
        opcodes::IADD
        | opcodes::ISUB
        | opcodes::IMUL
        | opcodes::IDIV
        | opcodes::IREM
        | opcodes::ISHL
        | opcodes::ISHR
        | opcodes::IUSHR
        | opcodes::IAND
        | opcodes::IOR
        | opcodes::IXOR
        | opcodes::LCMP..=opcodes::DCMPG => {
            pop(stack)?;
            pop(stack)?;
            stack.push(FrameType::Integer);
        }
        opcodes::LADD
        | opcodes::LSUB
        | opcodes::LMUL
        | opcodes::LDIV
        | opcodes::LREM
        | opcodes::LSHL
        | opcodes::LSHR
        | opcodes::LUSHR
        | opcodes::LAND
        | opcodes::LOR
        | opcodes::LXOR => {
            pop(stack)?;
            pop(stack)?;
            stack.push(FrameType::Long);
        }
        opcodes::FADD | opcodes::FSUB | opcodes::FMUL | opcodes::FDIV | opcodes::FREM => {
            pop(stack)?;
            pop(stack)?;
            stack.push(FrameType::Float);
        }
        opcodes::DADD | opcodes::DSUB | opcodes::DMUL | opcodes::DDIV | opcodes::DREM => {
            pop(stack)?;
            pop(stack)?;
            stack.push(FrameType::Double);
        }
        opcodes::INEG | opcodes::L2I | opcodes::F2I | opcodes::D2I | opcodes::I2B..=opcodes::I2S => {
            pop(stack)?;
            stack.push(FrameType::Integer);
        }
        opcodes::LNEG | opcodes::I2L | opcodes::F2L | opcodes::D2L => {
            pop(stack)?;
            stack.push(FrameType::Long);
        }
        opcodes::FNEG | opcodes::I2F | opcodes::L2F | opcodes::D2F => {
            pop(stack)?;
            stack.push(FrameType::Float);
        }
        opcodes::DNEG | opcodes::I2D | opcodes::L2D | opcodes::F2D => {
            pop(stack)?;
            stack.push(FrameType::Double);
        }
        opcodes::IRETURN..=opcodes::ARETURN
        | opcodes::ATHROW
        | opcodes::MONITORENTER
        | opcodes::MONITOREXIT => {
            pop(stack)?;
        }
        opcodes::ARRAYLENGTH => {
            pop(stack)?;
            stack.push(FrameType::Integer);
        }
        _ => {}
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn execute_invoke(
    offset: usize,
    owner: &str,
    name: &str,
    descriptor: &str,
    has_receiver: bool,
    class_name: &str,
    locals: &mut [FrameType],
    stack: &mut Vec<FrameType>,
) -> Result<(), ClassWriteError> {
    let underflow =
        || ClassWriteError::FrameComputation(format!("stack underflow at {offset}"));
    let (args, ret) = parse_method_descriptor(descriptor)?;
    for _ in &args {
        stack.pop().ok_or_else(underflow)?;
    }
    if has_receiver {
        let receiver = stack.pop().ok_or_else(underflow)?;
        if name == "<init>" {
            let init_owner = if receiver == FrameType::UninitializedThis {
                class_name
            } else {
                owner
            };
            initialize_uninitialized(locals, stack, &receiver, init_owner);
        }
    }
    if ret != FieldType::Void {
        stack.push(field_type_to_frame(ret));
    }
    Ok(())
}

fn member<'a>(
    member: &'a MemberRef,
    cp: &'a [CpInfo],
) -> Result<(&'a str, &'a str, &'a str), ClassWriteError> {
    match member {
        MemberRef::Index(index) => Ok(cp_member_ref(cp, *index)?),
        MemberRef::Symbolic {
            owner,
            name,
            descriptor,
        } => Ok((owner.as_str(), name.as_str(), descriptor.as_str())),
    }
}

fn initialize_uninitialized(
    locals: &mut [FrameType],
    stack: &mut [FrameType],
    receiver: &FrameType,
    owner: &str,
) {
    let init = FrameType::Object(owner.to_string());
    for value in locals.iter_mut().chain(stack.iter_mut()) {
        if value == receiver {
            *value = init.clone();
        }
    }
}

fn is_category2(value: &FrameType) -> bool {
    matches!(value, FrameType::Long | FrameType::Double)
}

fn load_local(locals: &[FrameType], index: u16) -> FrameType {
    locals.get(index as usize).cloned().unwrap_or(FrameType::Top)
}

fn store_local(locals: &mut Vec<FrameType>, index: u16, value: FrameType) {
    let idx = index as usize;
    let width = if is_category2(&value) { 2 } else { 1 };
    if locals.len() < idx + width {
        locals.resize(idx + width, FrameType::Top);
    }
    // Overwriting the second half of a long or double invalidates it.
    if idx > 0 && is_category2(&locals[idx - 1]) {
        locals[idx - 1] = FrameType::Top;
    }
    locals[idx] = value;
    if width == 2 {
        locals[idx + 1] = FrameType::Top;
    }
}

fn array_element_type(value: &FrameType) -> Option<FrameType> {
    let FrameType::Object(desc) = value else {
        return None;
    };
    let element = desc.strip_prefix('[')?;
    if element.starts_with('[') {
        return Some(FrameType::Object(element.to_string()));
    }
    element
        .strip_prefix('L')
        .and_then(|rest| rest.strip_suffix(';'))
        .map(|name| FrameType::Object(name.to_string()))
}

fn ldc_type(value: &LdcValue, cp: &[CpInfo], offset: usize) -> Result<FrameType, ClassWriteError> {
    let index = match value {
        LdcValue::Index(index) => *index,
        LdcValue::String(_) => return Ok(FrameType::Object(JAVA_LANG_STRING.to_string())),
        LdcValue::Int(_) => return Ok(FrameType::Integer),
    };
    match cp.get(index as usize) {
        Some(CpInfo::Integer(_)) => Ok(FrameType::Integer),
        Some(CpInfo::Float(_)) => Ok(FrameType::Float),
        Some(CpInfo::Long(_)) => Ok(FrameType::Long),
        Some(CpInfo::Double(_)) => Ok(FrameType::Double),
        Some(CpInfo::String { .. }) => Ok(FrameType::Object(JAVA_LANG_STRING.to_string())),
        Some(CpInfo::Class { .. }) => Ok(FrameType::Object("java/lang/Class".to_string())),
        Some(CpInfo::MethodType { .. }) => {
            Ok(FrameType::Object("java/lang/invoke/MethodType".to_string()))
        }
        Some(CpInfo::MethodHandle { .. }) => Ok(FrameType::Object(
            "java/lang/invoke/MethodHandle".to_string(),
        )),
        Some(CpInfo::Dynamic {
            name_and_type_index,
            ..
        }) => {
            let (_, descriptor) = cp_name_and_type(cp, *name_and_type_index)?;
            Ok(field_type_to_frame(parse_field_descriptor(descriptor)?))
        }
        _ => Err(ClassWriteError::FrameComputation(format!(
            "ldc of unloadable constant {index} at {offset}"
        ))),
    }
}

fn field_type_to_frame(field_type: FieldType) -> FrameType {
    match field_type {
        FieldType::Boolean
        | FieldType::Byte
        | FieldType::Char
        | FieldType::Short
        | FieldType::Int => FrameType::Integer,
        FieldType::Float => FrameType::Float,
        FieldType::Long => FrameType::Long,
        FieldType::Double => FrameType::Double,
        FieldType::Object(name) => FrameType::Object(name),
        FieldType::Array(desc) => FrameType::Object(desc),
        FieldType::Void => FrameType::Top,
    }
}

fn newarray_descriptor(atype: u8) -> Result<&'static str, ClassWriteError> {
    Ok(match atype {
        constants::T_BOOLEAN => "[Z",
        constants::T_CHAR => "[C",
        constants::T_FLOAT => "[F",
        constants::T_DOUBLE => "[D",
        constants::T_BYTE => "[B",
        constants::T_SHORT => "[S",
        constants::T_INT => "[I",
        constants::T_LONG => "[J",
        _ => {
            return Err(ClassWriteError::FrameComputation(format!(
                "invalid newarray type {atype}"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::assemble;
    use crate::hierarchy::BootstrapClasses;
    use crate::insn::{LabelNode, NodeList, TryCatchBlockNode};
    use crate::nodes::MethodBody;

    const STATIC: u16 = constants::ACC_PUBLIC | constants::ACC_STATIC;

    fn body(instructions: NodeList, try_catch_blocks: Vec<TryCatchBlockNode>) -> MethodBody {
        MethodBody {
            instructions,
            try_catch_blocks,
            local_variables: Vec::new(),
            local_variable_types: Vec::new(),
            max_stack: 0,
            max_locals: 0,
        }
    }

    fn analyze_static(
        descriptor: &str,
        body: &MethodBody,
        cp: &mut ConstantPoolBuilder,
    ) -> Result<Analysis, ClassWriteError> {
        let code = assemble(body, cp)?;
        let method = FrameMethod {
            class_name: "com/example/Subject",
            access_flags: STATIC,
            name: "run",
            descriptor,
        };
        analyze(&method, &code, cp, &BootstrapClasses, true)
    }

    #[test]
    fn test_straight_line_maxs_count_wide_values() {
        let code = insn_list! {
            [LLOAD_0]
            [LLOAD_2]
            [LADD]
            [LRETURN]
        };
        let mut cp = ConstantPoolBuilder::new();
        let analysis = analyze_static("(JJ)J", &body(code, Vec::new()), &mut cp).unwrap();
        assert_eq!(analysis.max_stack, 4);
        assert_eq!(analysis.max_locals, 4);
        assert!(analysis.frames.is_empty());
    }

    #[test]
    fn test_branch_frames_use_compressed_forms() {
        // 0 iload_0, 1 ifeq 8, 4 iconst_1, 5 goto 9, 8 iconst_2, 9 ireturn
        let code = insn_list! {
            [ILOAD_0]
            [jump IFEQ 8]
            [ICONST_1]
            [jump GOTO 9]
            [label 8]
            [ICONST_2]
            [label 9]
            [IRETURN]
        };
        let mut cp = ConstantPoolBuilder::new();
        let analysis = analyze_static("(I)I", &body(code, Vec::new()), &mut cp).unwrap();
        assert_eq!(
            analysis.frames,
            vec![
                StackMapFrame::SameFrame { offset_delta: 8 },
                StackMapFrame::SameLocals1StackItemFrame {
                    offset_delta: 0,
                    stack: VerificationTypeInfo::Integer,
                },
            ]
        );
        assert_eq!(analysis.max_stack, 1);
    }

    #[test]
    fn test_loop_emits_append_then_same() {
        // 0 iconst_0, 1 istore 0, 3 iload 0, 5 ifne 14, 8 iinc, 11 goto 3, 14 return
        let code = insn_list! {
            [ICONST_0]
            [var ISTORE 0]
            [label 3]
            [var ILOAD 0]
            [jump IFNE 14]
            [iinc IINC 0, 1]
            [jump GOTO 3]
            [label 14]
            [RETURN]
        };
        let mut cp = ConstantPoolBuilder::new();
        let analysis = analyze_static("()V", &body(code, Vec::new()), &mut cp).unwrap();
        assert_eq!(
            analysis.frames,
            vec![
                StackMapFrame::AppendFrame {
                    offset_delta: 3,
                    locals: vec![VerificationTypeInfo::Integer],
                },
                StackMapFrame::SameFrame { offset_delta: 10 },
            ]
        );
        assert_eq!(analysis.max_locals, 1);
    }

    #[test]
    fn test_handler_frame_merges_catch_types() {
        let mut cp = ConstantPoolBuilder::new();
        let iae = cp.class("java/lang/IllegalArgumentException");
        let ise = cp.class("java/lang/IllegalStateException");
        let code = insn_list! {
            [label 0]
            [method INVOKESTATIC "com/example/Work", "run", "()V"]
            [label 1]
            [RETURN]
            [label 2]
            [var ASTORE 0]
            [RETURN]
        };
        let blocks = [iae, ise]
            .into_iter()
            .map(|catch_type| TryCatchBlockNode {
                start: LabelNode { id: 0 },
                end: LabelNode { id: 1 },
                handler: LabelNode { id: 2 },
                catch_type,
            })
            .collect();
        let analysis = analyze_static("()V", &body(code, blocks), &mut cp).unwrap();
        let runtime_exception = cp.class("java/lang/RuntimeException");
        assert_eq!(
            analysis.frames,
            vec![StackMapFrame::SameLocals1StackItemFrame {
                offset_delta: 4,
                stack: VerificationTypeInfo::Object {
                    cpool_index: runtime_exception,
                },
            }]
        );
        assert_eq!(analysis.max_stack, 1);
    }

    #[test]
    fn test_unresolvable_join_names_missing_class() {
        let code = insn_list! {
            [ILOAD_0]
            [jump IFEQ 8]
            [ALOAD_1]
            [jump GOTO 9]
            [label 8]
            [ALOAD_2]
            [label 9]
            [ARETURN]
        };
        let mut cp = ConstantPoolBuilder::new();
        let err = analyze_static(
            "(ZLcom/acme/Left;Lcom/acme/Right;)Ljava/lang/Object;",
            &body(code, Vec::new()),
            &mut cp,
        )
        .unwrap_err();
        match err {
            ClassWriteError::Hierarchy(source) => {
                assert!(source.class_name().starts_with("com/acme/"));
            }
            other => panic!("expected hierarchy error, got {other:?}"),
        }
    }

    #[test]
    fn test_unreachable_code_is_rejected() {
        let code = insn_list! {
            [RETURN]
            [NOP]
            [RETURN]
        };
        let mut cp = ConstantPoolBuilder::new();
        let err = analyze_static("()V", &body(code, Vec::new()), &mut cp).unwrap_err();
        assert!(err.to_string().contains("unreachable code at 1"));
    }

    #[test]
    fn test_recompute_replaces_stack_map_and_keeps_max_locals() {
        let code = insn_list! {
            [ILOAD_0]
            [jump IFEQ 4]
            [label 4]
            [RETURN]
        };
        let mut cp = ConstantPoolBuilder::new();
        let mut attribute = assemble(&body(code, Vec::new()), &mut cp).unwrap();
        attribute.max_locals = 5;
        attribute.attributes.push(AttributeInfo::StackMapTable {
            entries: vec![StackMapFrame::SameFrame { offset_delta: 60 }],
        });
        let method = FrameMethod {
            class_name: "com/example/Subject",
            access_flags: STATIC,
            name: "run",
            descriptor: "(I)V",
        };
        recompute(&method, &mut attribute, &mut cp, &BootstrapClasses, constants::V1_8).unwrap();
        assert_eq!(attribute.max_locals, 5);
        assert_eq!(attribute.max_stack, 1);
        let tables: Vec<_> = attribute
            .attributes
            .iter()
            .filter_map(|attr| match attr {
                AttributeInfo::StackMapTable { entries } => Some(entries.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tables, vec![vec![StackMapFrame::SameFrame { offset_delta: 4 }]]);

        recompute(&method, &mut attribute, &mut cp, &BootstrapClasses, 49).unwrap();
        assert!(
            !attribute
                .attributes
                .iter()
                .any(|attr| matches!(attr, AttributeInfo::StackMapTable { .. }))
        );
    }

    #[test]
    fn test_constructor_initializes_this() {
        let code = insn_list! {
            [ALOAD_0]
            [method INVOKESPECIAL "java/lang/Object", "<init>", "()V"]
            [ALOAD_0]
            [jump IFNULL 8]
            [label 8]
            [RETURN]
        };
        let mut cp = ConstantPoolBuilder::new();
        let code = assemble(&body(code, Vec::new()), &mut cp).unwrap();
        let method = FrameMethod {
            class_name: "com/example/Subject",
            access_flags: constants::ACC_PUBLIC,
            name: "<init>",
            descriptor: "()V",
        };
        let analysis = analyze(&method, &code, &mut cp, &BootstrapClasses, true).unwrap();
        let subject = cp.class("com/example/Subject");
        // The branch target sees an initialized `this`, so the locals changed.
        assert_eq!(
            analysis.frames,
            vec![StackMapFrame::FullFrame {
                offset_delta: 8,
                locals: vec![VerificationTypeInfo::Object {
                    cpool_index: subject
                }],
                stack: Vec::new(),
            }]
        );
    }
}
