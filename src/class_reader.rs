use std::collections::{BTreeMap, BTreeSet};

use crate::constants;
use crate::error::ClassReadError;
use crate::insn::{
    AbstractInsnNode, FieldInsnNode, IincInsnNode, Insn, InsnNode, IntInsnNode,
    InvokeDynamicInsnNode, InvokeInterfaceInsnNode, JumpInsnNode, LabelNode, LdcInsnNode, LdcValue,
    LineNumberInsnNode, LocalVariableNode, LookupSwitchInsnNode, MemberRef, MethodInsnNode,
    MultiANewArrayInsnNode, NodeList, TableSwitchInsnNode, TryCatchBlockNode, TypeInsnNode,
    VarInsnNode,
};
use crate::nodes::{ClassNode, MethodBody, MethodNode};
use crate::opcodes;

#[derive(Debug, Clone, PartialEq)]
pub enum CpInfo {
    Unusable,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class {
        name_index: u16,
    },
    String {
        string_index: u16,
    },
    Fieldref {
        class_index: u16,
        name_and_type_index: u16,
    },
    Methodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    Module {
        name_index: u16,
    },
    Package {
        name_index: u16,
    },
}

/// A class file as laid out on disk. Attributes the converter never touches
/// are carried as [`AttributeInfo::Unknown`] so they re-encode byte for byte.
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: Vec<CpInfo>,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<AttributeInfo>,
}

impl ClassFile {
    pub fn cp_utf8(&self, index: u16) -> Result<&str, ClassReadError> {
        cp_utf8(&self.constant_pool, index)
    }

    pub fn class_name(&self, index: u16) -> Result<&str, ClassReadError> {
        cp_class_name(&self.constant_pool, index)
    }

    pub fn this_class_name(&self) -> Result<&str, ClassReadError> {
        self.class_name(self.this_class)
    }

    pub fn source_file(&self) -> Result<Option<&str>, ClassReadError> {
        for attr in &self.attributes {
            if let AttributeInfo::SourceFile { sourcefile_index } = attr {
                return self.cp_utf8(*sourcefile_index).map(Some);
            }
        }
        Ok(None)
    }

    pub fn bootstrap_methods(&self) -> &[BootstrapMethod] {
        self.attributes
            .iter()
            .find_map(|attr| match attr {
                AttributeInfo::BootstrapMethods { methods } => Some(methods.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn to_class_node(&self) -> Result<ClassNode, ClassReadError> {
        let name = self.this_class_name()?.to_string();
        let super_name = if self.super_class == 0 {
            None
        } else {
            Some(self.class_name(self.super_class)?.to_string())
        };
        let mut interfaces = Vec::with_capacity(self.interfaces.len());
        for index in &self.interfaces {
            interfaces.push(self.class_name(*index)?.to_string());
        }

        let mut methods = Vec::with_capacity(self.methods.len());
        for method in &self.methods {
            methods.push(MethodNode {
                access_flags: method.access_flags,
                name: self.cp_utf8(method.name_index)?.to_string(),
                descriptor: self.cp_utf8(method.descriptor_index)?.to_string(),
                has_code: method.code().is_some(),
            });
        }

        Ok(ClassNode {
            minor_version: self.minor_version,
            major_version: self.major_version,
            access_flags: self.access_flags,
            name,
            super_name,
            source_file: self.source_file()?.map(str::to_string),
            interfaces,
            methods,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

impl MethodInfo {
    pub fn code(&self) -> Option<&CodeAttribute> {
        self.attributes.iter().find_map(|attr| match attr {
            AttributeInfo::Code(code) => Some(code),
            _ => None,
        })
    }

    pub fn code_mut(&mut self) -> Option<&mut CodeAttribute> {
        self.attributes.iter_mut().find_map(|attr| match attr {
            AttributeInfo::Code(code) => Some(code),
            _ => None,
        })
    }
}

#[derive(Debug, Clone)]
pub enum AttributeInfo {
    Code(CodeAttribute),
    SourceFile { sourcefile_index: u16 },
    LineNumberTable { entries: Vec<LineNumber> },
    LocalVariableTable { entries: Vec<LocalVariable> },
    LocalVariableTypeTable { entries: Vec<LocalVariable> },
    StackMapTable { entries: Vec<StackMapFrame> },
    BootstrapMethods { methods: Vec<BootstrapMethod> },
    Unknown { name: String, info: Vec<u8> },
}

impl AttributeInfo {
    pub fn name(&self) -> &str {
        match self {
            AttributeInfo::Code(_) => "Code",
            AttributeInfo::SourceFile { .. } => "SourceFile",
            AttributeInfo::LineNumberTable { .. } => "LineNumberTable",
            AttributeInfo::LocalVariableTable { .. } => "LocalVariableTable",
            AttributeInfo::LocalVariableTypeTable { .. } => "LocalVariableTypeTable",
            AttributeInfo::StackMapTable { .. } => "StackMapTable",
            AttributeInfo::BootstrapMethods { .. } => "BootstrapMethods",
            AttributeInfo::Unknown { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNumber {
    pub start_pc: u16,
    pub line_number: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapMethod {
    pub bootstrap_method_ref: u16,
    pub bootstrap_arguments: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationTypeInfo {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    Object { cpool_index: u16 },
    Uninitialized { offset: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackMapFrame {
    SameFrame {
        offset_delta: u16,
    },
    SameLocals1StackItemFrame {
        offset_delta: u16,
        stack: VerificationTypeInfo,
    },
    SameLocals1StackItemFrameExtended {
        offset_delta: u16,
        stack: VerificationTypeInfo,
    },
    ChopFrame {
        offset_delta: u16,
        k: u8,
    },
    SameFrameExtended {
        offset_delta: u16,
    },
    AppendFrame {
        offset_delta: u16,
        locals: Vec<VerificationTypeInfo>,
    },
    FullFrame {
        offset_delta: u16,
        locals: Vec<VerificationTypeInfo>,
        stack: Vec<VerificationTypeInfo>,
    },
}

pub fn read_class_file(bytes: &[u8]) -> Result<ClassFile, ClassReadError> {
    let mut reader = ByteReader::new(bytes);
    let magic = reader.read_u4()?;
    if magic != constants::MAGIC {
        return Err(ClassReadError::InvalidMagic(magic));
    }
    let minor_version = reader.read_u2()?;
    let major_version = reader.read_u2()?;
    let constant_pool = read_constant_pool(&mut reader)?;
    let access_flags = reader.read_u2()?;
    let this_class = reader.read_u2()?;
    let super_class = reader.read_u2()?;
    let interfaces = read_u2_table(&mut reader)?;
    let fields = read_members(&mut reader, &constant_pool)?
        .into_iter()
        .map(|(access_flags, name_index, descriptor_index, attributes)| FieldInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        })
        .collect();
    let methods = read_members(&mut reader, &constant_pool)?
        .into_iter()
        .map(|(access_flags, name_index, descriptor_index, attributes)| MethodInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        })
        .collect();
    let attributes = read_attributes(&mut reader, &constant_pool)?;
    if reader.remaining() != 0 {
        return Err(ClassReadError::InvalidAttribute(
            "trailing bytes after class attributes".to_string(),
        ));
    }

    Ok(ClassFile {
        minor_version,
        major_version,
        constant_pool,
        access_flags,
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        attributes,
    })
}

/// Reads just enough of `bytes` to name the class, for error reporting when
/// the full parse fails later in the file.
pub fn peek_class_name(bytes: &[u8]) -> Option<String> {
    let mut reader = ByteReader::new(bytes);
    if reader.read_u4().ok()? != constants::MAGIC {
        return None;
    }
    reader.read_u2().ok()?;
    reader.read_u2().ok()?;
    let constant_pool = read_constant_pool(&mut reader).ok()?;
    reader.read_u2().ok()?;
    let this_class = reader.read_u2().ok()?;
    cp_class_name(&constant_pool, this_class)
        .ok()
        .map(str::to_string)
}

fn read_constant_pool(reader: &mut ByteReader<'_>) -> Result<Vec<CpInfo>, ClassReadError> {
    let count = reader.read_u2()? as usize;
    let mut pool = Vec::with_capacity(count);
    pool.push(CpInfo::Unusable);

    let mut index = 1;
    while index < count {
        let tag = reader.read_u1()?;
        let entry = match tag {
            1 => {
                let len = reader.read_u2()? as usize;
                let bytes = reader.read_bytes(len)?;
                CpInfo::Utf8(decode_modified_utf8(bytes)?)
            }
            3 => CpInfo::Integer(reader.read_u4()? as i32),
            4 => CpInfo::Float(f32::from_bits(reader.read_u4()?)),
            5 => CpInfo::Long(reader.read_u8()? as i64),
            6 => CpInfo::Double(f64::from_bits(reader.read_u8()?)),
            7 => CpInfo::Class {
                name_index: reader.read_u2()?,
            },
            8 => CpInfo::String {
                string_index: reader.read_u2()?,
            },
            9 => CpInfo::Fieldref {
                class_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            10 => CpInfo::Methodref {
                class_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            11 => CpInfo::InterfaceMethodref {
                class_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            12 => CpInfo::NameAndType {
                name_index: reader.read_u2()?,
                descriptor_index: reader.read_u2()?,
            },
            15 => CpInfo::MethodHandle {
                reference_kind: reader.read_u1()?,
                reference_index: reader.read_u2()?,
            },
            16 => CpInfo::MethodType {
                descriptor_index: reader.read_u2()?,
            },
            17 => CpInfo::Dynamic {
                bootstrap_method_attr_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            18 => CpInfo::InvokeDynamic {
                bootstrap_method_attr_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            19 => CpInfo::Module {
                name_index: reader.read_u2()?,
            },
            20 => CpInfo::Package {
                name_index: reader.read_u2()?,
            },
            _ => return Err(ClassReadError::InvalidConstantPoolTag(tag)),
        };

        pool.push(entry);

        // Long and double take two slots.
        if tag == 5 || tag == 6 {
            pool.push(CpInfo::Unusable);
            index += 2;
        } else {
            index += 1;
        }
    }

    Ok(pool)
}

fn read_u2_table(reader: &mut ByteReader<'_>) -> Result<Vec<u16>, ClassReadError> {
    let count = reader.read_u2()? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(reader.read_u2()?);
    }
    Ok(values)
}

type MemberHeader = (u16, u16, u16, Vec<AttributeInfo>);

fn read_members(
    reader: &mut ByteReader<'_>,
    cp: &[CpInfo],
) -> Result<Vec<MemberHeader>, ClassReadError> {
    let count = reader.read_u2()? as usize;
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        let access_flags = reader.read_u2()?;
        let name_index = reader.read_u2()?;
        let descriptor_index = reader.read_u2()?;
        let attributes = read_attributes(reader, cp)?;
        members.push((access_flags, name_index, descriptor_index, attributes));
    }
    Ok(members)
}

fn read_attributes(
    reader: &mut ByteReader<'_>,
    cp: &[CpInfo],
) -> Result<Vec<AttributeInfo>, ClassReadError> {
    let count = reader.read_u2()? as usize;
    let mut attributes = Vec::with_capacity(count);
    for _ in 0..count {
        let name_index = reader.read_u2()?;
        let length = reader.read_u4()? as usize;
        let name = cp_utf8(cp, name_index)?;
        let info = reader.read_bytes(length)?;
        attributes.push(parse_attribute(name, info, cp)?);
    }
    Ok(attributes)
}

fn parse_attribute(name: &str, info: &[u8], cp: &[CpInfo]) -> Result<AttributeInfo, ClassReadError> {
    let mut reader = ByteReader::new(info);
    let attribute = match name {
        "Code" => {
            let max_stack = reader.read_u2()?;
            let max_locals = reader.read_u2()?;
            let code_length = reader.read_u4()? as usize;
            let code = reader.read_bytes(code_length)?.to_vec();
            let exception_table_length = reader.read_u2()? as usize;
            let mut exception_table = Vec::with_capacity(exception_table_length);
            for _ in 0..exception_table_length {
                exception_table.push(ExceptionTableEntry {
                    start_pc: reader.read_u2()?,
                    end_pc: reader.read_u2()?,
                    handler_pc: reader.read_u2()?,
                    catch_type: reader.read_u2()?,
                });
            }
            let attributes = read_attributes(&mut reader, cp)?;
            AttributeInfo::Code(CodeAttribute {
                max_stack,
                max_locals,
                code,
                exception_table,
                attributes,
            })
        }
        "SourceFile" => AttributeInfo::SourceFile {
            sourcefile_index: reader.read_u2()?,
        },
        "LineNumberTable" => {
            let count = reader.read_u2()? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(LineNumber {
                    start_pc: reader.read_u2()?,
                    line_number: reader.read_u2()?,
                });
            }
            AttributeInfo::LineNumberTable { entries }
        }
        "LocalVariableTable" => AttributeInfo::LocalVariableTable {
            entries: read_local_variables(&mut reader)?,
        },
        "LocalVariableTypeTable" => AttributeInfo::LocalVariableTypeTable {
            entries: read_local_variables(&mut reader)?,
        },
        "StackMapTable" => {
            let count = reader.read_u2()? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(parse_stack_map_frame(&mut reader)?);
            }
            AttributeInfo::StackMapTable { entries }
        }
        "BootstrapMethods" => {
            let count = reader.read_u2()? as usize;
            let mut methods = Vec::with_capacity(count);
            for _ in 0..count {
                let bootstrap_method_ref = reader.read_u2()?;
                let bootstrap_arguments = read_u2_table(&mut reader)?;
                methods.push(BootstrapMethod {
                    bootstrap_method_ref,
                    bootstrap_arguments,
                });
            }
            AttributeInfo::BootstrapMethods { methods }
        }
        _ => {
            return Ok(AttributeInfo::Unknown {
                name: name.to_string(),
                info: info.to_vec(),
            });
        }
    };

    if reader.remaining() != 0 {
        return Err(ClassReadError::InvalidAttribute(name.to_string()));
    }

    Ok(attribute)
}

fn read_local_variables(reader: &mut ByteReader<'_>) -> Result<Vec<LocalVariable>, ClassReadError> {
    let count = reader.read_u2()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(LocalVariable {
            start_pc: reader.read_u2()?,
            length: reader.read_u2()?,
            name_index: reader.read_u2()?,
            descriptor_index: reader.read_u2()?,
            index: reader.read_u2()?,
        });
    }
    Ok(entries)
}

fn parse_stack_map_frame(reader: &mut ByteReader<'_>) -> Result<StackMapFrame, ClassReadError> {
    let frame_type = reader.read_u1()?;
    let frame = match frame_type {
        0..=63 => StackMapFrame::SameFrame {
            offset_delta: frame_type as u16,
        },
        64..=127 => StackMapFrame::SameLocals1StackItemFrame {
            offset_delta: (frame_type - 64) as u16,
            stack: parse_verification_type(reader)?,
        },
        247 => StackMapFrame::SameLocals1StackItemFrameExtended {
            offset_delta: reader.read_u2()?,
            stack: parse_verification_type(reader)?,
        },
        248..=250 => StackMapFrame::ChopFrame {
            offset_delta: reader.read_u2()?,
            k: 251 - frame_type,
        },
        251 => StackMapFrame::SameFrameExtended {
            offset_delta: reader.read_u2()?,
        },
        252..=254 => {
            let offset_delta = reader.read_u2()?;
            let locals_count = (frame_type - 251) as usize;
            let mut locals = Vec::with_capacity(locals_count);
            for _ in 0..locals_count {
                locals.push(parse_verification_type(reader)?);
            }
            StackMapFrame::AppendFrame {
                offset_delta,
                locals,
            }
        }
        255 => {
            let offset_delta = reader.read_u2()?;
            let locals_count = reader.read_u2()? as usize;
            let mut locals = Vec::with_capacity(locals_count);
            for _ in 0..locals_count {
                locals.push(parse_verification_type(reader)?);
            }
            let stack_count = reader.read_u2()? as usize;
            let mut stack = Vec::with_capacity(stack_count);
            for _ in 0..stack_count {
                stack.push(parse_verification_type(reader)?);
            }
            StackMapFrame::FullFrame {
                offset_delta,
                locals,
                stack,
            }
        }
        _ => {
            return Err(ClassReadError::InvalidAttribute(
                "StackMapTable".to_string(),
            ));
        }
    };
    Ok(frame)
}

fn parse_verification_type(
    reader: &mut ByteReader<'_>,
) -> Result<VerificationTypeInfo, ClassReadError> {
    let tag = reader.read_u1()?;
    let kind = match tag {
        0 => VerificationTypeInfo::Top,
        1 => VerificationTypeInfo::Integer,
        2 => VerificationTypeInfo::Float,
        3 => VerificationTypeInfo::Double,
        4 => VerificationTypeInfo::Long,
        5 => VerificationTypeInfo::Null,
        6 => VerificationTypeInfo::UninitializedThis,
        7 => VerificationTypeInfo::Object {
            cpool_index: reader.read_u2()?,
        },
        8 => VerificationTypeInfo::Uninitialized {
            offset: reader.read_u2()?,
        },
        _ => {
            return Err(ClassReadError::InvalidAttribute(
                "StackMapTable".to_string(),
            ));
        }
    };
    Ok(kind)
}

pub(crate) fn cp_utf8(cp: &[CpInfo], index: u16) -> Result<&str, ClassReadError> {
    match cp.get(index as usize) {
        Some(CpInfo::Utf8(value)) => Ok(value.as_str()),
        _ => Err(ClassReadError::InvalidIndex(index)),
    }
}

pub(crate) fn cp_class_name(cp: &[CpInfo], index: u16) -> Result<&str, ClassReadError> {
    match cp.get(index as usize) {
        Some(CpInfo::Class { name_index }) => cp_utf8(cp, *name_index),
        _ => Err(ClassReadError::InvalidIndex(index)),
    }
}

pub(crate) fn cp_name_and_type(cp: &[CpInfo], index: u16) -> Result<(&str, &str), ClassReadError> {
    match cp.get(index as usize) {
        Some(CpInfo::NameAndType {
            name_index,
            descriptor_index,
        }) => Ok((cp_utf8(cp, *name_index)?, cp_utf8(cp, *descriptor_index)?)),
        _ => Err(ClassReadError::InvalidIndex(index)),
    }
}

/// Resolves a field, method or interface method reference to
/// `(owner, name, descriptor)`.
pub(crate) fn cp_member_ref(
    cp: &[CpInfo],
    index: u16,
) -> Result<(&str, &str, &str), ClassReadError> {
    match cp.get(index as usize) {
        Some(
            CpInfo::Fieldref {
                class_index,
                name_and_type_index,
            }
            | CpInfo::Methodref {
                class_index,
                name_and_type_index,
            }
            | CpInfo::InterfaceMethodref {
                class_index,
                name_and_type_index,
            },
        ) => {
            let owner = cp_class_name(cp, *class_index)?;
            let (name, desc) = cp_name_and_type(cp, *name_and_type_index)?;
            Ok((owner, name, desc))
        }
        _ => Err(ClassReadError::InvalidIndex(index)),
    }
}

pub(crate) fn cp_invoke_dynamic(cp: &[CpInfo], index: u16) -> Result<(&str, &str), ClassReadError> {
    match cp.get(index as usize) {
        Some(CpInfo::InvokeDynamic {
            name_and_type_index,
            ..
        }) => cp_name_and_type(cp, *name_and_type_index),
        _ => Err(ClassReadError::InvalidIndex(index)),
    }
}

fn decode_modified_utf8(bytes: &[u8]) -> Result<String, ClassReadError> {
    let mut code_units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        if byte & 0x80 == 0 {
            code_units.push(byte as u16);
            i += 1;
        } else if byte & 0xE0 == 0xC0 {
            if i + 1 >= bytes.len() {
                return Err(ClassReadError::Utf8Error("truncated 2-byte".to_string()));
            }
            let byte2 = bytes[i + 1];
            if byte2 & 0xC0 != 0x80 {
                return Err(ClassReadError::Utf8Error("invalid 2-byte".to_string()));
            }
            code_units.push((((byte & 0x1F) as u16) << 6) | ((byte2 & 0x3F) as u16));
            i += 2;
        } else if byte & 0xF0 == 0xE0 {
            if i + 2 >= bytes.len() {
                return Err(ClassReadError::Utf8Error("truncated 3-byte".to_string()));
            }
            let byte2 = bytes[i + 1];
            let byte3 = bytes[i + 2];
            if byte2 & 0xC0 != 0x80 || byte3 & 0xC0 != 0x80 {
                return Err(ClassReadError::Utf8Error("invalid 3-byte".to_string()));
            }
            code_units.push(
                (((byte & 0x0F) as u16) << 12)
                    | (((byte2 & 0x3F) as u16) << 6)
                    | ((byte3 & 0x3F) as u16),
            );
            i += 3;
        } else {
            return Err(ClassReadError::Utf8Error(
                "invalid leading byte".to_string(),
            ));
        }
    }

    String::from_utf16(&code_units)
        .map_err(|_| ClassReadError::Utf8Error("invalid utf16".to_string()))
}

/// Decodes a `code` array into instructions paired with their offsets.
/// Branch targets become labels whose id is the absolute target offset.
pub fn decode_instructions(code: &[u8]) -> Result<Vec<(usize, Insn)>, ClassReadError> {
    let mut reader = ByteReader::new(code);
    let mut insns = Vec::new();

    while reader.remaining() > 0 {
        let opcode_offset = reader.pos();
        let opcode = reader.read_u1()?;
        let insn = match opcode {
            opcodes::NOP..=opcodes::DCONST_1 => Insn::Simple(InsnNode { opcode }),
            opcodes::BIPUSH => Insn::Int(IntInsnNode {
                insn: InsnNode { opcode },
                operand: reader.read_u1()? as i8 as i32,
            }),
            opcodes::SIPUSH => Insn::Int(IntInsnNode {
                insn: InsnNode { opcode },
                operand: reader.read_u2()? as i16 as i32,
            }),
            opcodes::LDC => Insn::Ldc(LdcInsnNode {
                insn: InsnNode { opcode },
                value: LdcValue::Index(reader.read_u1()? as u16),
            }),
            opcodes::LDC_W | opcodes::LDC2_W => Insn::Ldc(LdcInsnNode {
                insn: InsnNode { opcode },
                value: LdcValue::Index(reader.read_u2()?),
            }),
            opcodes::ILOAD..=opcodes::ALOAD
            | opcodes::ISTORE..=opcodes::ASTORE
            | opcodes::RET => Insn::Var(VarInsnNode {
                insn: InsnNode { opcode },
                var_index: reader.read_u1()? as u16,
            }),
            opcodes::ILOAD_0..=opcodes::SALOAD
            | opcodes::ISTORE_0..=opcodes::LXOR
            | opcodes::I2L..=opcodes::DCMPG => Insn::Simple(InsnNode { opcode }),
            opcodes::IINC => Insn::Iinc(IincInsnNode {
                insn: InsnNode { opcode },
                var_index: reader.read_u1()? as u16,
                increment: reader.read_u1()? as i8 as i16,
            }),
            opcodes::IFEQ..=opcodes::JSR | opcodes::IFNULL | opcodes::IFNONNULL => {
                let rel = reader.read_u2()? as i16 as i64;
                Insn::Jump(JumpInsnNode {
                    insn: InsnNode { opcode },
                    target: branch_label(code, opcode_offset, rel)?,
                })
            }
            opcodes::GOTO_W | opcodes::JSR_W => {
                let rel = reader.read_u4()? as i32 as i64;
                Insn::Jump(JumpInsnNode {
                    insn: InsnNode { opcode },
                    target: branch_label(code, opcode_offset, rel)?,
                })
            }
            opcodes::TABLESWITCH => read_table_switch(&mut reader, code, opcode_offset)?,
            opcodes::LOOKUPSWITCH => read_lookup_switch(&mut reader, code, opcode_offset)?,
            opcodes::IRETURN..=opcodes::RETURN
            | opcodes::ARRAYLENGTH
            | opcodes::ATHROW
            | opcodes::MONITORENTER
            | opcodes::MONITOREXIT => Insn::Simple(InsnNode { opcode }),
            opcodes::GETSTATIC..=opcodes::PUTFIELD => Insn::Field(FieldInsnNode {
                insn: InsnNode { opcode },
                field_ref: MemberRef::Index(reader.read_u2()?),
            }),
            opcodes::INVOKEVIRTUAL..=opcodes::INVOKESTATIC => Insn::Method(MethodInsnNode {
                insn: InsnNode { opcode },
                method_ref: MemberRef::Index(reader.read_u2()?),
            }),
            opcodes::INVOKEINTERFACE => {
                let method_index = reader.read_u2()?;
                let count = reader.read_u1()?;
                reader.read_u1()?;
                Insn::InvokeInterface(InvokeInterfaceInsnNode {
                    insn: InsnNode { opcode },
                    method_ref: MemberRef::Index(method_index),
                    count,
                })
            }
            opcodes::INVOKEDYNAMIC => {
                let method_index = reader.read_u2()?;
                reader.read_u2()?;
                Insn::InvokeDynamic(InvokeDynamicInsnNode {
                    insn: InsnNode { opcode },
                    method_index,
                })
            }
            opcodes::NEW | opcodes::ANEWARRAY | opcodes::CHECKCAST | opcodes::INSTANCEOF => {
                Insn::Type(TypeInsnNode {
                    insn: InsnNode { opcode },
                    class_ref: crate::insn::ClassRef::Index(reader.read_u2()?),
                })
            }
            opcodes::NEWARRAY => Insn::Int(IntInsnNode {
                insn: InsnNode { opcode },
                operand: reader.read_u1()? as i32,
            }),
            opcodes::WIDE => read_wide(&mut reader, opcode_offset)?,
            opcodes::MULTIANEWARRAY => Insn::MultiANewArray(MultiANewArrayInsnNode {
                insn: InsnNode { opcode },
                type_index: reader.read_u2()?,
                dimensions: reader.read_u1()?,
            }),
            _ => {
                return Err(ClassReadError::InvalidOpcode {
                    opcode,
                    offset: opcode_offset,
                });
            }
        };

        insns.push((opcode_offset, insn));
    }

    Ok(insns)
}

fn branch_label(code: &[u8], opcode_offset: usize, rel: i64) -> Result<LabelNode, ClassReadError> {
    let target = opcode_offset as i64 + rel;
    if target < 0 || target >= code.len() as i64 {
        return Err(ClassReadError::InvalidAttribute(format!(
            "branch at {opcode_offset} targets {target} outside the code array"
        )));
    }
    Ok(LabelNode {
        id: target as usize,
    })
}

fn read_table_switch(
    reader: &mut ByteReader<'_>,
    code: &[u8],
    opcode_offset: usize,
) -> Result<Insn, ClassReadError> {
    reader.align4(opcode_offset)?;
    let default = branch_label(code, opcode_offset, reader.read_u4()? as i32 as i64)?;
    let low = reader.read_u4()? as i32;
    let high = reader.read_u4()? as i32;
    if high < low {
        return Err(ClassReadError::InvalidAttribute(format!(
            "tableswitch at {opcode_offset} has high < low"
        )));
    }
    let count = (high as i64 - low as i64 + 1) as usize;
    let mut targets = Vec::with_capacity(count.min(reader.remaining() / 4));
    for _ in 0..count {
        targets.push(branch_label(code, opcode_offset, reader.read_u4()? as i32 as i64)?);
    }
    Ok(Insn::TableSwitch(TableSwitchInsnNode {
        insn: InsnNode {
            opcode: opcodes::TABLESWITCH,
        },
        default,
        low,
        high,
        targets,
    }))
}

fn read_lookup_switch(
    reader: &mut ByteReader<'_>,
    code: &[u8],
    opcode_offset: usize,
) -> Result<Insn, ClassReadError> {
    reader.align4(opcode_offset)?;
    let default = branch_label(code, opcode_offset, reader.read_u4()? as i32 as i64)?;
    let npairs = reader.read_u4()? as i32;
    if npairs < 0 {
        return Err(ClassReadError::InvalidAttribute(format!(
            "lookupswitch at {opcode_offset} has negative npairs"
        )));
    }
    let mut pairs = Vec::with_capacity((npairs as usize).min(reader.remaining() / 8));
    for _ in 0..npairs {
        let key = reader.read_u4()? as i32;
        let target = branch_label(code, opcode_offset, reader.read_u4()? as i32 as i64)?;
        pairs.push((key, target));
    }
    Ok(Insn::LookupSwitch(LookupSwitchInsnNode {
        insn: InsnNode {
            opcode: opcodes::LOOKUPSWITCH,
        },
        default,
        pairs,
    }))
}

fn read_wide(reader: &mut ByteReader<'_>, opcode_offset: usize) -> Result<Insn, ClassReadError> {
    let opcode = reader.read_u1()?;
    match opcode {
        opcodes::ILOAD..=opcodes::ALOAD | opcodes::ISTORE..=opcodes::ASTORE | opcodes::RET => {
            Ok(Insn::Var(VarInsnNode {
                insn: InsnNode { opcode },
                var_index: reader.read_u2()?,
            }))
        }
        opcodes::IINC => Ok(Insn::Iinc(IincInsnNode {
            insn: InsnNode { opcode },
            var_index: reader.read_u2()?,
            increment: reader.read_u2()? as i16,
        })),
        _ => Err(ClassReadError::InvalidOpcode {
            opcode,
            offset: opcode_offset,
        }),
    }
}

/// Lifts a `Code` attribute into a label-addressed [`MethodBody`]. Every
/// instruction gets a label named after its original offset, and one more
/// label marks the end of the code array.
pub fn read_method_body(code: &CodeAttribute) -> Result<MethodBody, ClassReadError> {
    let instructions = decode_instructions(&code.code)?;
    let code_end = code.code.len();
    let boundaries: BTreeSet<usize> = instructions
        .iter()
        .map(|(offset, _)| *offset)
        .chain(std::iter::once(code_end))
        .collect();
    let label_at = |offset: usize, what: &str| -> Result<LabelNode, ClassReadError> {
        if boundaries.contains(&offset) {
            Ok(LabelNode { id: offset })
        } else {
            Err(ClassReadError::InvalidAttribute(format!(
                "{what} refers to offset {offset} inside an instruction"
            )))
        }
    };

    for (offset, insn) in &instructions {
        let targets: Vec<LabelNode> = match insn {
            Insn::Jump(node) => vec![node.target],
            Insn::TableSwitch(node) => std::iter::once(node.default)
                .chain(node.targets.iter().copied())
                .collect(),
            Insn::LookupSwitch(node) => std::iter::once(node.default)
                .chain(node.pairs.iter().map(|(_, label)| *label))
                .collect(),
            _ => continue,
        };
        for target in targets {
            label_at(target.id, &format!("branch at {offset}"))?;
        }
    }

    let mut lines: BTreeMap<usize, Vec<u16>> = BTreeMap::new();
    let mut local_variables = Vec::new();
    let mut local_variable_types = Vec::new();
    for attr in &code.attributes {
        match attr {
            AttributeInfo::LineNumberTable { entries } => {
                for entry in entries {
                    let start = label_at(entry.start_pc as usize, "LineNumberTable")?;
                    lines.entry(start.id).or_default().push(entry.line_number);
                }
            }
            AttributeInfo::LocalVariableTable { entries } => {
                for entry in entries {
                    local_variables.push(local_variable_node(entry, &label_at)?);
                }
            }
            AttributeInfo::LocalVariableTypeTable { entries } => {
                for entry in entries {
                    local_variable_types.push(local_variable_node(entry, &label_at)?);
                }
            }
            _ => {}
        }
    }

    let mut try_catch_blocks = Vec::with_capacity(code.exception_table.len());
    for entry in &code.exception_table {
        try_catch_blocks.push(TryCatchBlockNode {
            start: label_at(entry.start_pc as usize, "exception table")?,
            end: label_at(entry.end_pc as usize, "exception table")?,
            handler: label_at(entry.handler_pc as usize, "exception table")?,
            catch_type: entry.catch_type,
        });
    }

    let mut nodes = NodeList::new();
    for (offset, insn) in instructions {
        let label = LabelNode { id: offset };
        nodes.add(label);
        if let Some(line_numbers) = lines.get(&offset) {
            for line in line_numbers {
                nodes.add(LineNumberInsnNode {
                    line: *line,
                    start: label,
                });
            }
        }
        nodes.add(AbstractInsnNode::Insn(insn));
    }
    nodes.add(LabelNode { id: code_end });

    Ok(MethodBody {
        instructions: nodes,
        try_catch_blocks,
        local_variables,
        local_variable_types,
        max_stack: code.max_stack,
        max_locals: code.max_locals,
    })
}

fn local_variable_node<F>(entry: &LocalVariable, label_at: &F) -> Result<LocalVariableNode, ClassReadError>
where
    F: Fn(usize, &str) -> Result<LabelNode, ClassReadError>,
{
    let start = entry.start_pc as usize;
    Ok(LocalVariableNode {
        start: label_at(start, "LocalVariableTable")?,
        end: label_at(start + entry.length as usize, "LocalVariableTable")?,
        name_index: entry.name_index,
        descriptor_index: entry.descriptor_index,
        index: entry.index,
    })
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn align4(&mut self, opcode_offset: usize) -> Result<(), ClassReadError> {
        let padding = (4 - ((opcode_offset + 1) % 4)) % 4;
        self.read_bytes(padding)?;
        Ok(())
    }

    fn read_u1(&mut self) -> Result<u8, ClassReadError> {
        if self.pos >= self.data.len() {
            return Err(ClassReadError::UnexpectedEof);
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u2(&mut self) -> Result<u16, ClassReadError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u4(&mut self) -> Result<u32, ClassReadError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u8(&mut self) -> Result<u64, ClassReadError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ClassReadError> {
        if self.pos + len > self.data.len() {
            return Err(ClassReadError::UnexpectedEof);
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}
