//! Field and method descriptor parsing.

use std::iter::Peekable;

use crate::error::ClassReadError;
use crate::opcodes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    /// Internal name of a class.
    Object(String),
    /// Full array descriptor, e.g. `[Ljava/lang/Object;`.
    Array(String),
    Void,
}

impl FieldType {
    /// Local variable slots taken by a value of this type.
    pub fn size(&self) -> u16 {
        match self {
            FieldType::Long | FieldType::Double => 2,
            FieldType::Void => 0,
            _ => 1,
        }
    }

    pub fn load_opcode(&self) -> u8 {
        match self {
            FieldType::Long => opcodes::LLOAD,
            FieldType::Float => opcodes::FLOAD,
            FieldType::Double => opcodes::DLOAD,
            FieldType::Object(_) | FieldType::Array(_) => opcodes::ALOAD,
            _ => opcodes::ILOAD,
        }
    }

    pub fn store_opcode(&self) -> u8 {
        match self {
            FieldType::Long => opcodes::LSTORE,
            FieldType::Float => opcodes::FSTORE,
            FieldType::Double => opcodes::DSTORE,
            FieldType::Object(_) | FieldType::Array(_) => opcodes::ASTORE,
            _ => opcodes::ISTORE,
        }
    }

    pub fn descriptor(&self) -> String {
        match self {
            FieldType::Boolean => "Z".to_string(),
            FieldType::Byte => "B".to_string(),
            FieldType::Char => "C".to_string(),
            FieldType::Short => "S".to_string(),
            FieldType::Int => "I".to_string(),
            FieldType::Float => "F".to_string(),
            FieldType::Long => "J".to_string(),
            FieldType::Double => "D".to_string(),
            FieldType::Object(name) => format!("L{name};"),
            FieldType::Array(desc) => desc.clone(),
            FieldType::Void => "V".to_string(),
        }
    }
}

pub fn parse_field_descriptor(desc: &str) -> Result<FieldType, ClassReadError> {
    let mut chars = desc.chars().peekable();
    let ty = parse_field_type(&mut chars, desc)?;
    if chars.next().is_some() {
        return Err(ClassReadError::InvalidDescriptor(desc.to_string()));
    }
    Ok(ty)
}

pub fn parse_method_descriptor(desc: &str) -> Result<(Vec<FieldType>, FieldType), ClassReadError> {
    let mut chars = desc.chars().peekable();
    if chars.next() != Some('(') {
        return Err(ClassReadError::InvalidDescriptor(desc.to_string()));
    }
    let mut params = Vec::new();
    loop {
        match chars.peek() {
            Some(')') => {
                chars.next();
                break;
            }
            Some(_) => params.push(parse_field_type(&mut chars, desc)?),
            None => return Err(ClassReadError::InvalidDescriptor(desc.to_string())),
        }
    }
    let ret = match chars.peek() {
        Some('V') => {
            chars.next();
            FieldType::Void
        }
        _ => parse_field_type(&mut chars, desc)?,
    };
    if chars.next().is_some() {
        return Err(ClassReadError::InvalidDescriptor(desc.to_string()));
    }
    Ok((params, ret))
}

/// Argument slots of a method descriptor, excluding any receiver.
pub fn argument_slots(desc: &str) -> Result<u16, ClassReadError> {
    let (params, _) = parse_method_descriptor(desc)?;
    Ok(params.iter().map(FieldType::size).sum())
}

fn parse_field_type<I>(chars: &mut Peekable<I>, desc: &str) -> Result<FieldType, ClassReadError>
where
    I: Iterator<Item = char>,
{
    match chars.next() {
        Some('Z') => Ok(FieldType::Boolean),
        Some('B') => Ok(FieldType::Byte),
        Some('C') => Ok(FieldType::Char),
        Some('S') => Ok(FieldType::Short),
        Some('I') => Ok(FieldType::Int),
        Some('F') => Ok(FieldType::Float),
        Some('J') => Ok(FieldType::Long),
        Some('D') => Ok(FieldType::Double),
        Some('L') => {
            let mut name = String::new();
            loop {
                match chars.next() {
                    Some(';') => break,
                    Some(ch) => name.push(ch),
                    None => return Err(ClassReadError::InvalidDescriptor(desc.to_string())),
                }
            }
            if name.is_empty() {
                return Err(ClassReadError::InvalidDescriptor(desc.to_string()));
            }
            Ok(FieldType::Object(name))
        }
        Some('[') => {
            let inner = parse_field_type(chars, desc)?;
            if inner == FieldType::Void {
                return Err(ClassReadError::InvalidDescriptor(desc.to_string()));
            }
            Ok(FieldType::Array(format!("[{}", inner.descriptor())))
        }
        _ => Err(ClassReadError::InvalidDescriptor(desc.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method_descriptor() {
        let (params, ret) = parse_method_descriptor(
            "(Lorg/apache/logging/log4j/Marker;Ljava/lang/String;[[IJ)Ljava/lang/Object;",
        )
        .unwrap();
        assert_eq!(
            params,
            vec![
                FieldType::Object("org/apache/logging/log4j/Marker".to_string()),
                FieldType::Object("java/lang/String".to_string()),
                FieldType::Array("[[I".to_string()),
                FieldType::Long,
            ]
        );
        assert_eq!(ret, FieldType::Object("java/lang/Object".to_string()));
        assert_eq!(argument_slots("(IJDLjava/lang/String;)V").unwrap(), 6);
    }

    #[test]
    fn test_rejects_truncated_descriptors() {
        assert!(parse_method_descriptor("(Ljava/lang/String").is_err());
        assert!(parse_method_descriptor("()").is_err());
        assert!(parse_field_descriptor("[V").is_err());
        assert!(parse_field_descriptor("II").is_err());
    }
}
