use crate::class_reader::{
    AttributeInfo, BootstrapMethod, ClassFile, CpInfo, ExceptionTableEntry, FieldInfo,
    LineNumber, LocalVariable, MethodInfo, StackMapFrame, VerificationTypeInfo,
};
use crate::constants;
use crate::error::ClassWriteError;

/// Serializes a [`ClassFile`]. Attribute names missing from the pool are
/// appended to a copy of it before anything is written.
pub fn write_class_file(class_file: &ClassFile) -> Result<Vec<u8>, ClassWriteError> {
    ClassFileWriter.to_bytes(class_file)
}

struct ClassFileWriter;

impl ClassFileWriter {
    fn to_bytes(&self, class_file: &ClassFile) -> Result<Vec<u8>, ClassWriteError> {
        if class_file.constant_pool.is_empty() {
            return Err(ClassWriteError::InvalidConstantPool(0));
        }

        let mut cp = class_file.constant_pool.clone();
        let mut attribute_names = Vec::new();
        collect_attribute_names(&class_file.attributes, &mut attribute_names);
        for field in &class_file.fields {
            collect_attribute_names(&field.attributes, &mut attribute_names);
        }
        for method in &class_file.methods {
            collect_attribute_names(&method.attributes, &mut attribute_names);
        }
        for name in attribute_names {
            ensure_utf8(&mut cp, &name);
        }
        if cp.len() > u16::MAX as usize {
            return Err(ClassWriteError::ConstantPoolOverflow(cp.len()));
        }

        let mut out = Vec::new();
        write_u4(&mut out, constants::MAGIC);
        write_u2(&mut out, class_file.minor_version);
        write_u2(&mut out, class_file.major_version);
        write_constant_pool(&mut out, &cp)?;
        write_u2(&mut out, class_file.access_flags);
        write_u2(&mut out, class_file.this_class);
        write_u2(&mut out, class_file.super_class);
        write_u2(&mut out, class_file.interfaces.len() as u16);
        for index in &class_file.interfaces {
            write_u2(&mut out, *index);
        }

        write_u2(&mut out, class_file.fields.len() as u16);
        for field in &class_file.fields {
            write_field(&mut out, field, &cp)?;
        }

        write_u2(&mut out, class_file.methods.len() as u16);
        for method in &class_file.methods {
            write_method(&mut out, method, &cp)?;
        }

        write_attributes(&mut out, &class_file.attributes, &cp)?;
        Ok(out)
    }
}

fn write_field(out: &mut Vec<u8>, field: &FieldInfo, cp: &[CpInfo]) -> Result<(), ClassWriteError> {
    write_u2(out, field.access_flags);
    write_u2(out, field.name_index);
    write_u2(out, field.descriptor_index);
    write_attributes(out, &field.attributes, cp)
}

fn write_method(
    out: &mut Vec<u8>,
    method: &MethodInfo,
    cp: &[CpInfo],
) -> Result<(), ClassWriteError> {
    write_u2(out, method.access_flags);
    write_u2(out, method.name_index);
    write_u2(out, method.descriptor_index);
    write_attributes(out, &method.attributes, cp)
}

fn write_attributes(
    out: &mut Vec<u8>,
    attributes: &[AttributeInfo],
    cp: &[CpInfo],
) -> Result<(), ClassWriteError> {
    write_u2(out, attributes.len() as u16);
    for attr in attributes {
        write_attribute(out, attr, cp)?;
    }
    Ok(())
}

fn write_attribute(
    out: &mut Vec<u8>,
    attr: &AttributeInfo,
    cp: &[CpInfo],
) -> Result<(), ClassWriteError> {
    let name_index = cp_find_utf8(cp, attr.name())
        .ok_or(ClassWriteError::InvalidConstantPool(0))?;
    let mut info = Vec::new();
    match attr {
        AttributeInfo::Code(code) => {
            if code.code.len() > u16::MAX as usize {
                return Err(ClassWriteError::CodeTooLarge(code.code.len()));
            }
            write_u2(&mut info, code.max_stack);
            write_u2(&mut info, code.max_locals);
            write_u4(&mut info, code.code.len() as u32);
            info.extend_from_slice(&code.code);
            write_u2(&mut info, code.exception_table.len() as u16);
            for entry in &code.exception_table {
                write_exception_table_entry(&mut info, entry);
            }
            write_attributes(&mut info, &code.attributes, cp)?;
        }
        AttributeInfo::SourceFile { sourcefile_index } => {
            write_u2(&mut info, *sourcefile_index);
        }
        AttributeInfo::LineNumberTable { entries } => {
            write_u2(&mut info, entries.len() as u16);
            for entry in entries {
                write_line_number(&mut info, entry);
            }
        }
        AttributeInfo::LocalVariableTable { entries }
        | AttributeInfo::LocalVariableTypeTable { entries } => {
            write_u2(&mut info, entries.len() as u16);
            for entry in entries {
                write_local_variable(&mut info, entry);
            }
        }
        AttributeInfo::StackMapTable { entries } => {
            write_u2(&mut info, entries.len() as u16);
            for entry in entries {
                write_stack_map_frame(&mut info, entry);
            }
        }
        AttributeInfo::BootstrapMethods { methods } => {
            write_u2(&mut info, methods.len() as u16);
            for method in methods {
                write_bootstrap_method(&mut info, method);
            }
        }
        AttributeInfo::Unknown { info: raw, .. } => info.extend_from_slice(raw),
    }
    write_u2(out, name_index);
    write_u4(out, info.len() as u32);
    out.extend_from_slice(&info);
    Ok(())
}

fn write_exception_table_entry(out: &mut Vec<u8>, entry: &ExceptionTableEntry) {
    write_u2(out, entry.start_pc);
    write_u2(out, entry.end_pc);
    write_u2(out, entry.handler_pc);
    write_u2(out, entry.catch_type);
}

fn write_line_number(out: &mut Vec<u8>, entry: &LineNumber) {
    write_u2(out, entry.start_pc);
    write_u2(out, entry.line_number);
}

fn write_local_variable(out: &mut Vec<u8>, entry: &LocalVariable) {
    write_u2(out, entry.start_pc);
    write_u2(out, entry.length);
    write_u2(out, entry.name_index);
    write_u2(out, entry.descriptor_index);
    write_u2(out, entry.index);
}

fn write_bootstrap_method(out: &mut Vec<u8>, entry: &BootstrapMethod) {
    write_u2(out, entry.bootstrap_method_ref);
    write_u2(out, entry.bootstrap_arguments.len() as u16);
    for arg in &entry.bootstrap_arguments {
        write_u2(out, *arg);
    }
}

fn write_stack_map_frame(out: &mut Vec<u8>, frame: &StackMapFrame) {
    match frame {
        StackMapFrame::SameFrame { offset_delta } => {
            write_u1(out, *offset_delta as u8);
        }
        StackMapFrame::SameLocals1StackItemFrame {
            offset_delta,
            stack,
        } => {
            write_u1(out, (*offset_delta as u8) + 64);
            write_verification_type(out, stack);
        }
        StackMapFrame::SameLocals1StackItemFrameExtended {
            offset_delta,
            stack,
        } => {
            write_u1(out, 247);
            write_u2(out, *offset_delta);
            write_verification_type(out, stack);
        }
        StackMapFrame::ChopFrame { offset_delta, k } => {
            write_u1(out, 251 - *k);
            write_u2(out, *offset_delta);
        }
        StackMapFrame::SameFrameExtended { offset_delta } => {
            write_u1(out, 251);
            write_u2(out, *offset_delta);
        }
        StackMapFrame::AppendFrame {
            offset_delta,
            locals,
        } => {
            write_u1(out, 251 + locals.len() as u8);
            write_u2(out, *offset_delta);
            for local in locals {
                write_verification_type(out, local);
            }
        }
        StackMapFrame::FullFrame {
            offset_delta,
            locals,
            stack,
        } => {
            write_u1(out, 255);
            write_u2(out, *offset_delta);
            write_u2(out, locals.len() as u16);
            for local in locals {
                write_verification_type(out, local);
            }
            write_u2(out, stack.len() as u16);
            for value in stack {
                write_verification_type(out, value);
            }
        }
    }
}

fn write_verification_type(out: &mut Vec<u8>, value: &VerificationTypeInfo) {
    match value {
        VerificationTypeInfo::Top => write_u1(out, 0),
        VerificationTypeInfo::Integer => write_u1(out, 1),
        VerificationTypeInfo::Float => write_u1(out, 2),
        VerificationTypeInfo::Double => write_u1(out, 3),
        VerificationTypeInfo::Long => write_u1(out, 4),
        VerificationTypeInfo::Null => write_u1(out, 5),
        VerificationTypeInfo::UninitializedThis => write_u1(out, 6),
        VerificationTypeInfo::Object { cpool_index } => {
            write_u1(out, 7);
            write_u2(out, *cpool_index);
        }
        VerificationTypeInfo::Uninitialized { offset } => {
            write_u1(out, 8);
            write_u2(out, *offset);
        }
    }
}

fn collect_attribute_names(attributes: &[AttributeInfo], names: &mut Vec<String>) {
    for attr in attributes {
        names.push(attr.name().to_string());
        if let AttributeInfo::Code(code) = attr {
            collect_attribute_names(&code.attributes, names);
        }
    }
}

fn write_constant_pool(out: &mut Vec<u8>, cp: &[CpInfo]) -> Result<(), ClassWriteError> {
    write_u2(out, cp.len() as u16);
    for entry in cp.iter().skip(1) {
        match entry {
            CpInfo::Unusable => {}
            CpInfo::Utf8(value) => {
                let bytes = encode_modified_utf8(value);
                if bytes.len() > u16::MAX as usize {
                    return Err(ClassWriteError::Utf8TooLong(bytes.len()));
                }
                write_u1(out, 1);
                write_u2(out, bytes.len() as u16);
                out.extend_from_slice(&bytes);
            }
            CpInfo::Integer(value) => {
                write_u1(out, 3);
                write_u4(out, *value as u32);
            }
            CpInfo::Float(value) => {
                write_u1(out, 4);
                write_u4(out, value.to_bits());
            }
            CpInfo::Long(value) => {
                write_u1(out, 5);
                write_u8(out, *value as u64);
            }
            CpInfo::Double(value) => {
                write_u1(out, 6);
                write_u8(out, value.to_bits());
            }
            CpInfo::Class { name_index } => {
                write_u1(out, 7);
                write_u2(out, *name_index);
            }
            CpInfo::String { string_index } => {
                write_u1(out, 8);
                write_u2(out, *string_index);
            }
            CpInfo::Fieldref {
                class_index,
                name_and_type_index,
            } => {
                write_u1(out, 9);
                write_u2(out, *class_index);
                write_u2(out, *name_and_type_index);
            }
            CpInfo::Methodref {
                class_index,
                name_and_type_index,
            } => {
                write_u1(out, 10);
                write_u2(out, *class_index);
                write_u2(out, *name_and_type_index);
            }
            CpInfo::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => {
                write_u1(out, 11);
                write_u2(out, *class_index);
                write_u2(out, *name_and_type_index);
            }
            CpInfo::NameAndType {
                name_index,
                descriptor_index,
            } => {
                write_u1(out, 12);
                write_u2(out, *name_index);
                write_u2(out, *descriptor_index);
            }
            CpInfo::MethodHandle {
                reference_kind,
                reference_index,
            } => {
                write_u1(out, 15);
                write_u1(out, *reference_kind);
                write_u2(out, *reference_index);
            }
            CpInfo::MethodType { descriptor_index } => {
                write_u1(out, 16);
                write_u2(out, *descriptor_index);
            }
            CpInfo::Dynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                write_u1(out, 17);
                write_u2(out, *bootstrap_method_attr_index);
                write_u2(out, *name_and_type_index);
            }
            CpInfo::InvokeDynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                write_u1(out, 18);
                write_u2(out, *bootstrap_method_attr_index);
                write_u2(out, *name_and_type_index);
            }
            CpInfo::Module { name_index } => {
                write_u1(out, 19);
                write_u2(out, *name_index);
            }
            CpInfo::Package { name_index } => {
                write_u1(out, 20);
                write_u2(out, *name_index);
            }
        }
    }
    Ok(())
}

/// Java's modified UTF-8: NUL is two bytes and supplementary characters are
/// written as surrogate pairs of three bytes each.
pub(crate) fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) as u8 & 0x1F));
                out.push(0x80 | (unit as u8 & 0x3F));
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) as u8 & 0x0F));
                out.push(0x80 | ((unit >> 6) as u8 & 0x3F));
                out.push(0x80 | (unit as u8 & 0x3F));
            }
        }
    }
    out
}

fn ensure_utf8(cp: &mut Vec<CpInfo>, value: &str) -> u16 {
    if let Some(index) = cp_find_utf8(cp, value) {
        return index;
    }
    cp.push(CpInfo::Utf8(value.to_string()));
    (cp.len() - 1) as u16
}

fn cp_find_utf8(cp: &[CpInfo], value: &str) -> Option<u16> {
    for (index, entry) in cp.iter().enumerate() {
        if let CpInfo::Utf8(existing) = entry
            && existing == value
        {
            return Some(index as u16);
        }
    }
    None
}

fn write_u1(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

fn write_u2(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_u4(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_u8(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_reader::read_class_file;

    fn minimal_class() -> ClassFile {
        ClassFile {
            minor_version: 0,
            major_version: 52,
            constant_pool: vec![
                CpInfo::Unusable,
                CpInfo::Utf8("com/example/Foo".to_string()),
                CpInfo::Class { name_index: 1 },
                CpInfo::Utf8("java/lang/Object".to_string()),
                CpInfo::Class { name_index: 3 },
                CpInfo::Utf8("Foo.java".to_string()),
            ],
            access_flags: constants::ACC_PUBLIC | constants::ACC_SUPER,
            this_class: 2,
            super_class: 4,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: vec![AttributeInfo::SourceFile {
                sourcefile_index: 5,
            }],
        }
    }

    #[test]
    fn test_appends_missing_attribute_names() {
        let bytes = write_class_file(&minimal_class()).unwrap();
        assert_eq!(&bytes[0..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
        let parsed = read_class_file(&bytes).unwrap();
        assert_eq!(parsed.constant_pool.len(), 7);
        assert_eq!(parsed.this_class_name().unwrap(), "com/example/Foo");
        assert_eq!(parsed.source_file().unwrap(), Some("Foo.java"));
    }

    #[test]
    fn test_rewrite_of_parsed_class_is_stable() {
        let first = write_class_file(&minimal_class()).unwrap();
        let second = write_class_file(&read_class_file(&first).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_modified_utf8_encoding() {
        assert_eq!(encode_modified_utf8("a"), vec![b'a']);
        assert_eq!(encode_modified_utf8("\0"), vec![0xC0, 0x80]);
        assert_eq!(encode_modified_utf8("\u{e9}"), vec![0xC3, 0xA9]);
        // U+1F600 becomes the surrogate pair D83D DE00.
        assert_eq!(
            encode_modified_utf8("\u{1F600}"),
            vec![0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80]
        );
    }
}
