/// Builds a [`NodeList`](crate::insn::NodeList) from bracketed instructions.
///
/// Each bracket is one node:
///
/// * `[OPCODE]`: no operands, e.g. `[RETURN]`
/// * `[int OPCODE value]`: `BIPUSH`, `SIPUSH`, `NEWARRAY`
/// * `[var OPCODE index]`: loads and stores
/// * `[type OPCODE "internal/Name"]`
/// * `[field OPCODE "owner", "name", "descriptor"]`
/// * `[method OPCODE "owner", "name", "descriptor"]`
/// * `[iface "owner", "name", "descriptor"]`: `INVOKEINTERFACE`
/// * `[ldc "string"]`
/// * `[jump OPCODE label]`: branch to the label with that id
/// * `[iinc IINC index, increment]`
/// * `[label id]` and `[line number, label]`
///
/// ```rust
/// use location_weaver::insn::{AbstractInsnNode, Insn, LabelNode};
/// use location_weaver::{insn_list, opcodes};
///
/// let list = insn_list! {
///     [label 0]
///     [line 42, 0]
///     [var ALOAD 0]
///     [jump IFNULL 1]
///     [ldc "hello"]
///     [POP]
///     [label 1]
///     [RETURN]
/// };
/// let nodes = list.nodes();
/// assert_eq!(nodes.len(), 8);
/// assert_eq!(nodes[0], AbstractInsnNode::Label(LabelNode { id: 0 }));
/// match &nodes[3] {
///     AbstractInsnNode::Insn(Insn::Jump(node)) => {
///         assert_eq!(node.insn.opcode, opcodes::IFNULL);
///         assert_eq!(node.target, LabelNode { id: 1 });
///     }
///     other => panic!("expected jump, got {other:?}"),
/// }
/// ```
#[macro_export]
macro_rules! insn_list {
    ( $( [ $($instruction:tt)+ ] )* ) => {
        {
            let mut list = $crate::insn::NodeList::new();
            $(
                $crate::insn_list!(@dispatch list, $($instruction)+);
            )*
            list
        }
    };

    (@dispatch $list:ident, $opcode:ident) => {
        $list.add($crate::insn::Insn::from($crate::insn::InsnNode {
            opcode: $crate::opcodes::$opcode,
        }));
    };

    (@dispatch $list:ident, int $opcode:ident $operand:expr) => {
        $list.add($crate::insn::Insn::from($crate::insn::IntInsnNode {
            insn: $crate::insn::InsnNode { opcode: $crate::opcodes::$opcode },
            operand: $operand as i32,
        }));
    };

    (@dispatch $list:ident, var $opcode:ident $index:expr) => {
        $list.add($crate::insn::Insn::from($crate::insn::VarInsnNode {
            insn: $crate::insn::InsnNode { opcode: $crate::opcodes::$opcode },
            var_index: $index as u16,
        }));
    };

    (@dispatch $list:ident, type $opcode:ident $name:expr) => {
        $list.add($crate::insn::Insn::from($crate::insn::TypeInsnNode::new(
            $crate::opcodes::$opcode,
            $name,
        )));
    };

    (@dispatch $list:ident, field $opcode:ident $owner:expr, $name:expr, $desc:expr) => {
        $list.add($crate::insn::Insn::from($crate::insn::FieldInsnNode::new(
            $crate::opcodes::$opcode,
            $owner,
            $name,
            $desc,
        )));
    };

    (@dispatch $list:ident, method $opcode:ident $owner:expr, $name:expr, $desc:expr) => {
        $list.add($crate::insn::Insn::from($crate::insn::MethodInsnNode::new(
            $crate::opcodes::$opcode,
            $owner,
            $name,
            $desc,
        )));
    };

    (@dispatch $list:ident, iface $owner:expr, $name:expr, $desc:expr) => {
        $list.add($crate::insn::Insn::from($crate::insn::InvokeInterfaceInsnNode::new(
            $owner,
            $name,
            $desc,
        )));
    };

    (@dispatch $list:ident, ldc $value:expr) => {
        $list.add($crate::insn::Insn::from($crate::insn::LdcInsnNode::string($value)));
    };

    (@dispatch $list:ident, jump $opcode:ident $target:expr) => {
        $list.add($crate::insn::Insn::from($crate::insn::JumpInsnNode {
            insn: $crate::insn::InsnNode { opcode: $crate::opcodes::$opcode },
            target: $crate::insn::LabelNode { id: $target as usize },
        }));
    };

    (@dispatch $list:ident, iinc $opcode:ident $var:expr, $incr:expr) => {
        $list.add($crate::insn::Insn::from($crate::insn::IincInsnNode {
            insn: $crate::insn::InsnNode { opcode: $crate::opcodes::$opcode },
            var_index: $var as u16,
            increment: $incr as i16,
        }));
    };

    (@dispatch $list:ident, label $id:expr) => {
        $list.add($crate::insn::LabelNode { id: $id as usize });
    };

    (@dispatch $list:ident, line $line:expr, $label:expr) => {
        $list.add($crate::insn::LineNumberInsnNode {
            line: $line as u16,
            start: $crate::insn::LabelNode { id: $label as usize },
        });
    };
}
