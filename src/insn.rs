use crate::descriptor;
use crate::opcodes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsnNode {
    pub opcode: u8,
}

/// `BIPUSH`, `SIPUSH` and `NEWARRAY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntInsnNode {
    pub insn: InsnNode,
    pub operand: i32,
}

/// Loads, stores and `RET`. Indices above 255 are encoded with `WIDE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarInsnNode {
    pub insn: InsnNode,
    pub var_index: u16,
}

/// `NEW`, `ANEWARRAY`, `CHECKCAST` and `INSTANCEOF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInsnNode {
    pub insn: InsnNode,
    pub class_ref: ClassRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInsnNode {
    pub insn: InsnNode,
    pub field_ref: MemberRef,
}

/// `INVOKEVIRTUAL`, `INVOKESPECIAL` and `INVOKESTATIC`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInsnNode {
    pub insn: InsnNode,
    pub method_ref: MemberRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeInterfaceInsnNode {
    pub insn: InsnNode,
    pub method_ref: MemberRef,
    pub count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeDynamicInsnNode {
    pub insn: InsnNode,
    pub method_index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpInsnNode {
    pub insn: InsnNode,
    pub target: LabelNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdcInsnNode {
    pub insn: InsnNode,
    pub value: LdcValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IincInsnNode {
    pub insn: InsnNode,
    pub var_index: u16,
    pub increment: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSwitchInsnNode {
    pub insn: InsnNode,
    pub default: LabelNode,
    pub low: i32,
    pub high: i32,
    pub targets: Vec<LabelNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupSwitchInsnNode {
    pub insn: InsnNode,
    pub default: LabelNode,
    pub pairs: Vec<(i32, LabelNode)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiANewArrayInsnNode {
    pub insn: InsnNode,
    pub type_index: u16,
    pub dimensions: u8,
}

/// A position in a method body. Decoded bodies use the original bytecode
/// offset as the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelNode {
    pub id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineNumberInsnNode {
    pub line: u16,
    pub start: LabelNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryCatchBlockNode {
    pub start: LabelNode,
    pub end: LabelNode,
    pub handler: LabelNode,
    /// Constant pool index of the caught class, 0 for `finally`.
    pub catch_type: u16,
}

/// One entry of `LocalVariableTable` or `LocalVariableTypeTable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariableNode {
    pub start: LabelNode,
    pub end: LabelNode,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbstractInsnNode {
    Label(LabelNode),
    LineNumber(LineNumberInsnNode),
    Insn(Insn),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    Simple(InsnNode),
    Int(IntInsnNode),
    Var(VarInsnNode),
    Type(TypeInsnNode),
    Field(FieldInsnNode),
    Method(MethodInsnNode),
    InvokeInterface(InvokeInterfaceInsnNode),
    InvokeDynamic(InvokeDynamicInsnNode),
    Jump(JumpInsnNode),
    Ldc(LdcInsnNode),
    Iinc(IincInsnNode),
    TableSwitch(TableSwitchInsnNode),
    LookupSwitch(LookupSwitchInsnNode),
    MultiANewArray(MultiANewArrayInsnNode),
}

impl Insn {
    pub fn opcode(&self) -> u8 {
        match self {
            Insn::Simple(node) => node.opcode,
            Insn::Int(node) => node.insn.opcode,
            Insn::Var(node) => node.insn.opcode,
            Insn::Type(node) => node.insn.opcode,
            Insn::Field(node) => node.insn.opcode,
            Insn::Method(node) => node.insn.opcode,
            Insn::InvokeInterface(node) => node.insn.opcode,
            Insn::InvokeDynamic(node) => node.insn.opcode,
            Insn::Jump(node) => node.insn.opcode,
            Insn::Ldc(node) => node.insn.opcode,
            Insn::Iinc(node) => node.insn.opcode,
            Insn::TableSwitch(node) => node.insn.opcode,
            Insn::LookupSwitch(node) => node.insn.opcode,
            Insn::MultiANewArray(node) => node.insn.opcode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberRef {
    Index(u16),
    Symbolic {
        owner: String,
        name: String,
        descriptor: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassRef {
    Index(u16),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LdcValue {
    Index(u16),
    String(String),
    Int(i32),
}

#[derive(Debug, Clone, Default)]
pub struct InsnList {
    insns: Vec<Insn>,
}

impl InsnList {
    pub fn new() -> Self {
        Self { insns: Vec::new() }
    }

    pub fn add<T: Into<Insn>>(&mut self, insn: T) -> &mut Self {
        self.insns.push(insn.into());
        self
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn into_insns(self) -> Vec<Insn> {
        self.insns
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    pub fn append(&mut self, other: InsnList) -> &mut Self {
        self.insns.extend(other.insns);
        self
    }

    /// Pushes an int constant with the shortest encoding.
    pub fn push_int(&mut self, value: i32) -> &mut Self {
        match value {
            -1..=5 => self.add(InsnNode {
                opcode: (opcodes::ICONST_0 as i32 + value) as u8,
            }),
            -128..=127 => self.add(IntInsnNode {
                insn: InsnNode {
                    opcode: opcodes::BIPUSH,
                },
                operand: value,
            }),
            -32768..=32767 => self.add(IntInsnNode {
                insn: InsnNode {
                    opcode: opcodes::SIPUSH,
                },
                operand: value,
            }),
            _ => self.add(LdcInsnNode::int(value)),
        }
    }

    pub fn var(&mut self, opcode: u8, var_index: u16) -> &mut Self {
        self.add(VarInsnNode {
            insn: InsnNode { opcode },
            var_index,
        })
    }
}

impl IntoIterator for InsnList {
    type Item = Insn;
    type IntoIter = std::vec::IntoIter<Insn>;

    fn into_iter(self) -> Self::IntoIter {
        self.insns.into_iter()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeList {
    nodes: Vec<AbstractInsnNode>,
}

impl NodeList {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn add<T: Into<AbstractInsnNode>>(&mut self, node: T) -> &mut Self {
        self.nodes.push(node.into());
        self
    }

    pub fn nodes(&self) -> &[AbstractInsnNode] {
        &self.nodes
    }

    pub fn into_nodes(self) -> Vec<AbstractInsnNode> {
        self.nodes
    }

    pub fn extend(&mut self, list: InsnList) -> &mut Self {
        self.nodes
            .extend(list.into_iter().map(AbstractInsnNode::Insn));
        self
    }

    pub fn append(&mut self, other: NodeList) -> &mut Self {
        self.nodes.extend(other.nodes);
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl From<Vec<AbstractInsnNode>> for NodeList {
    fn from(nodes: Vec<AbstractInsnNode>) -> Self {
        Self { nodes }
    }
}

impl From<InsnList> for NodeList {
    fn from(list: InsnList) -> Self {
        Self {
            nodes: list.into_iter().map(AbstractInsnNode::Insn).collect(),
        }
    }
}

impl From<LabelNode> for AbstractInsnNode {
    fn from(value: LabelNode) -> Self {
        AbstractInsnNode::Label(value)
    }
}

impl From<LineNumberInsnNode> for AbstractInsnNode {
    fn from(value: LineNumberInsnNode) -> Self {
        AbstractInsnNode::LineNumber(value)
    }
}

impl From<Insn> for AbstractInsnNode {
    fn from(value: Insn) -> Self {
        AbstractInsnNode::Insn(value)
    }
}

impl FieldInsnNode {
    pub fn new(opcode: u8, owner: &str, name: &str, descriptor: &str) -> Self {
        Self {
            insn: InsnNode { opcode },
            field_ref: MemberRef::Symbolic {
                owner: owner.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            },
        }
    }
}

impl MethodInsnNode {
    pub fn new(opcode: u8, owner: &str, name: &str, descriptor: &str) -> Self {
        Self {
            insn: InsnNode { opcode },
            method_ref: MemberRef::Symbolic {
                owner: owner.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            },
        }
    }
}

impl InvokeInterfaceInsnNode {
    /// `count` is derived from the descriptor: one slot for the receiver plus the argument slots.
    pub fn new(owner: &str, name: &str, descriptor: &str) -> Self {
        let count = descriptor::argument_slots(descriptor).map_or(1, |slots| slots + 1);
        Self {
            insn: InsnNode {
                opcode: opcodes::INVOKEINTERFACE,
            },
            method_ref: MemberRef::Symbolic {
                owner: owner.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            },
            count: count as u8,
        }
    }
}

impl TypeInsnNode {
    pub fn new(opcode: u8, class_name: &str) -> Self {
        Self {
            insn: InsnNode { opcode },
            class_ref: ClassRef::Name(class_name.to_string()),
        }
    }
}

impl LdcInsnNode {
    pub fn string(value: &str) -> Self {
        Self {
            insn: InsnNode {
                opcode: opcodes::LDC,
            },
            value: LdcValue::String(value.to_string()),
        }
    }

    pub fn int(value: i32) -> Self {
        Self {
            insn: InsnNode {
                opcode: opcodes::LDC,
            },
            value: LdcValue::Int(value),
        }
    }
}

impl From<InsnNode> for Insn {
    fn from(value: InsnNode) -> Self {
        Insn::Simple(value)
    }
}

impl From<IntInsnNode> for Insn {
    fn from(value: IntInsnNode) -> Self {
        Insn::Int(value)
    }
}

impl From<VarInsnNode> for Insn {
    fn from(value: VarInsnNode) -> Self {
        Insn::Var(value)
    }
}

impl From<TypeInsnNode> for Insn {
    fn from(value: TypeInsnNode) -> Self {
        Insn::Type(value)
    }
}

impl From<FieldInsnNode> for Insn {
    fn from(value: FieldInsnNode) -> Self {
        Insn::Field(value)
    }
}

impl From<MethodInsnNode> for Insn {
    fn from(value: MethodInsnNode) -> Self {
        Insn::Method(value)
    }
}

impl From<InvokeInterfaceInsnNode> for Insn {
    fn from(value: InvokeInterfaceInsnNode) -> Self {
        Insn::InvokeInterface(value)
    }
}

impl From<InvokeDynamicInsnNode> for Insn {
    fn from(value: InvokeDynamicInsnNode) -> Self {
        Insn::InvokeDynamic(value)
    }
}

impl From<JumpInsnNode> for Insn {
    fn from(value: JumpInsnNode) -> Self {
        Insn::Jump(value)
    }
}

impl From<LdcInsnNode> for Insn {
    fn from(value: LdcInsnNode) -> Self {
        Insn::Ldc(value)
    }
}

impl From<IincInsnNode> for Insn {
    fn from(value: IincInsnNode) -> Self {
        Insn::Iinc(value)
    }
}

impl From<TableSwitchInsnNode> for Insn {
    fn from(value: TableSwitchInsnNode) -> Self {
        Insn::TableSwitch(value)
    }
}

impl From<LookupSwitchInsnNode> for Insn {
    fn from(value: LookupSwitchInsnNode) -> Self {
        Insn::LookupSwitch(value)
    }
}

impl From<MultiANewArrayInsnNode> for Insn {
    fn from(value: MultiANewArrayInsnNode) -> Self {
        Insn::MultiANewArray(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_int_picks_shortest_form() {
        let mut list = InsnList::new();
        list.push_int(0).push_int(-1).push_int(100).push_int(1000).push_int(70000);
        let insns = list.into_insns();
        assert_eq!(insns[0].opcode(), opcodes::ICONST_0);
        assert_eq!(insns[1].opcode(), opcodes::ICONST_M1);
        assert_eq!(insns[2].opcode(), opcodes::BIPUSH);
        assert_eq!(insns[3].opcode(), opcodes::SIPUSH);
        if let Insn::Ldc(node) = &insns[4] {
            assert_eq!(node.value, LdcValue::Int(70000));
        } else {
            panic!("Expected Ldc Insn at index 4");
        }
    }

    #[test]
    fn test_invoke_interface_count_includes_receiver() {
        let node = InvokeInterfaceInsnNode::new(
            "org/apache/logging/log4j/LogBuilder",
            "log",
            "(Ljava/lang/String;JD)V",
        );
        assert_eq!(node.count, 6);
        let node = InvokeInterfaceInsnNode::new("a/B", "run", "()V");
        assert_eq!(node.count, 1);
    }
}
