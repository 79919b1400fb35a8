use crate::insn::{LocalVariableNode, NodeList, TryCatchBlockNode};

/// Name-resolved view of a class header and its method table.
#[derive(Debug, Clone)]
pub struct ClassNode {
    pub minor_version: u16,
    pub major_version: u16,
    pub access_flags: u16,
    pub name: String,
    pub super_name: Option<String>,
    pub source_file: Option<String>,
    pub interfaces: Vec<String>,
    pub methods: Vec<MethodNode>,
}

#[derive(Debug, Clone)]
pub struct MethodNode {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub has_code: bool,
}

/// A method's code as a label-addressed node list. Branches, handlers,
/// line numbers and local variable ranges all point at labels, so
/// instructions can be inserted or replaced without fixing offsets by hand.
#[derive(Debug, Clone)]
pub struct MethodBody {
    pub instructions: NodeList,
    pub try_catch_blocks: Vec<TryCatchBlockNode>,
    pub local_variables: Vec<LocalVariableNode>,
    pub local_variable_types: Vec<LocalVariableNode>,
    pub max_stack: u16,
    pub max_locals: u16,
}
