//! Access flags and other fixed class-file values.

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;

pub const MAGIC: u32 = 0xCAFEBABE;

/// Java 8. Generated cache classes use this version.
pub const V1_8: u16 = 52;
/// First version that carries `StackMapTable`.
pub const V1_6: u16 = 50;
/// First version that allows `invokedynamic`.
pub const V1_7: u16 = 51;

/// `MethodHandle` reference kinds.
pub const REF_INVOKE_STATIC: u8 = 6;

/// `newarray` element type codes.
pub const T_BOOLEAN: u8 = 4;
pub const T_CHAR: u8 = 5;
pub const T_FLOAT: u8 = 6;
pub const T_DOUBLE: u8 = 7;
pub const T_BYTE: u8 = 8;
pub const T_SHORT: u8 = 9;
pub const T_INT: u8 = 10;
pub const T_LONG: u8 = 11;

pub const JAVA_LANG_OBJECT: &str = "java/lang/Object";
pub const JAVA_LANG_THROWABLE: &str = "java/lang/Throwable";
pub const JAVA_LANG_STRING: &str = "java/lang/String";
