//! The closed set of message suppliers shared through cache classes.
//!
//! Each shape is one static method `(captures)Message` on the cache class and
//! is bound to `org.apache.logging.log4j.util.Supplier` at the call site.

use crate::api;
use crate::insn::NodeList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LambdaShape {
    /// `traceEntry()`
    Entry,
    /// `traceEntry(String, Object...)`
    EntryFormat,
    /// `traceEntry(Supplier...)`
    EntrySuppliers,
    /// `traceEntry(String, Supplier...)`
    EntryFormatSuppliers,
    /// `traceEntry(Message)`
    EntryMessage,
    /// `traceExit()`
    Exit,
    /// `traceExit(R)`
    ExitResult,
    /// `traceExit(String, R)`
    ExitFormatResult,
    /// `traceExit(EntryMessage)`
    ExitEntry,
    /// `traceExit(EntryMessage, R)`
    ExitEntryResult,
    /// `traceExit(Message, R)`
    ExitMessageResult,
    /// `printf(Level, [Marker,] String, Object...)`
    Formatted,
}

const LOGGER: &str = "Lorg/apache/logging/log4j/Logger;";
const STRING: &str = "Ljava/lang/String;";
const OBJECT: &str = "Ljava/lang/Object;";
const OBJECTS: &str = "[Ljava/lang/Object;";
const SUPPLIERS: &str = "[Lorg/apache/logging/log4j/util/Supplier;";
const MESSAGE: &str = "Lorg/apache/logging/log4j/message/Message;";
const ENTRY_MESSAGE: &str = "Lorg/apache/logging/log4j/message/EntryMessage;";

const NEW_ENTRY_FORMAT: &str =
    "(Ljava/lang/String;[Ljava/lang/Object;)Lorg/apache/logging/log4j/message/EntryMessage;";
const NEW_ENTRY_MESSAGE: &str =
    "(Lorg/apache/logging/log4j/message/Message;)Lorg/apache/logging/log4j/message/EntryMessage;";
const NEW_EXIT_FORMAT: &str =
    "(Ljava/lang/String;Ljava/lang/Object;)Lorg/apache/logging/log4j/message/ExitMessage;";
const NEW_EXIT_ENTRY: &str =
    "(Lorg/apache/logging/log4j/message/EntryMessage;)Lorg/apache/logging/log4j/message/ExitMessage;";
const NEW_EXIT_ENTRY_RESULT: &str = "(Ljava/lang/Object;Lorg/apache/logging/log4j/message/EntryMessage;)Lorg/apache/logging/log4j/message/ExitMessage;";
const NEW_EXIT_MESSAGE_RESULT: &str = "(Ljava/lang/Object;Lorg/apache/logging/log4j/message/Message;)Lorg/apache/logging/log4j/message/ExitMessage;";

impl LambdaShape {
    pub const ALL: [LambdaShape; 12] = [
        LambdaShape::Entry,
        LambdaShape::EntryFormat,
        LambdaShape::EntrySuppliers,
        LambdaShape::EntryFormatSuppliers,
        LambdaShape::EntryMessage,
        LambdaShape::Exit,
        LambdaShape::ExitResult,
        LambdaShape::ExitFormatResult,
        LambdaShape::ExitEntry,
        LambdaShape::ExitEntryResult,
        LambdaShape::ExitMessageResult,
        LambdaShape::Formatted,
    ];

    /// Name of the static method in the cache class.
    pub fn method_name(self) -> &'static str {
        match self {
            LambdaShape::Entry => "entry",
            LambdaShape::EntryFormat => "entryFormat",
            LambdaShape::EntrySuppliers => "entrySuppliers",
            LambdaShape::EntryFormatSuppliers => "entryFormatSuppliers",
            LambdaShape::EntryMessage => "entryMessage",
            LambdaShape::Exit => "exit",
            LambdaShape::ExitResult => "exitResult",
            LambdaShape::ExitFormatResult => "exitFormatResult",
            LambdaShape::ExitEntry => "exitEntry",
            LambdaShape::ExitEntryResult => "exitEntryResult",
            LambdaShape::ExitMessageResult => "exitMessageResult",
            LambdaShape::Formatted => "formatted",
        }
    }

    /// Descriptors of the captured values, in call order.
    pub fn captures(self) -> &'static [&'static str] {
        match self {
            LambdaShape::Entry | LambdaShape::Exit => &[LOGGER],
            LambdaShape::EntryFormat => &[LOGGER, STRING, OBJECTS],
            LambdaShape::EntrySuppliers => &[LOGGER, SUPPLIERS],
            LambdaShape::EntryFormatSuppliers => &[LOGGER, STRING, SUPPLIERS],
            LambdaShape::EntryMessage => &[LOGGER, MESSAGE],
            LambdaShape::ExitResult => &[LOGGER, OBJECT],
            LambdaShape::ExitFormatResult => &[LOGGER, STRING, OBJECT],
            LambdaShape::ExitEntry => &[LOGGER, ENTRY_MESSAGE],
            LambdaShape::ExitEntryResult => &[LOGGER, ENTRY_MESSAGE, OBJECT],
            LambdaShape::ExitMessageResult => &[LOGGER, MESSAGE, OBJECT],
            LambdaShape::Formatted => &[STRING, OBJECTS],
        }
    }

    /// Descriptor of the static implementation method.
    pub fn descriptor(self) -> String {
        format!("({}){MESSAGE}", self.captures().concat())
    }

    /// Descriptor of the `invokedynamic` that binds the captures.
    pub fn factory_descriptor(self) -> String {
        format!("({})L{};", self.captures().concat(), api::SUPPLIER)
    }

    /// Body of the static implementation method.
    pub fn body(self) -> NodeList {
        match self {
            LambdaShape::Formatted => insn_list! {
                [type NEW api::STRING_FORMATTED_MESSAGE]
                [DUP]
                [ALOAD_0]
                [ALOAD_1]
                [method INVOKESPECIAL api::STRING_FORMATTED_MESSAGE, "<init>", "(Ljava/lang/String;[Ljava/lang/Object;)V"]
                [ARETURN]
            },
            _ => {
                let mut list = insn_list! {
                    [ALOAD_0]
                    [iface api::LOGGER, "getFlowMessageFactory", api::GET_FLOW_MESSAGE_FACTORY_DESC]
                };
                list.append(self.flow_arguments());
                list
            }
        }
    }

    /// Arguments and call to the flow message factory; the factory is on
    /// the stack already.
    fn flow_arguments(self) -> NodeList {
        let factory = api::FLOW_MESSAGE_FACTORY;
        match self {
            LambdaShape::Entry => insn_list! {
                [ACONST_NULL]
                [ACONST_NULL]
                [iface factory, "newEntryMessage", NEW_ENTRY_FORMAT]
                [ARETURN]
            },
            LambdaShape::EntryFormat => insn_list! {
                [ALOAD_1]
                [ALOAD_2]
                [iface factory, "newEntryMessage", NEW_ENTRY_FORMAT]
                [ARETURN]
            },
            LambdaShape::EntrySuppliers => insn_list! {
                [ACONST_NULL]
                [ALOAD_1]
                [method INVOKESTATIC api::LAMBDA_UTIL, "getAll", api::LAMBDA_UTIL_GET_ALL_DESC]
                [iface factory, "newEntryMessage", NEW_ENTRY_FORMAT]
                [ARETURN]
            },
            LambdaShape::EntryFormatSuppliers => insn_list! {
                [ALOAD_1]
                [ALOAD_2]
                [method INVOKESTATIC api::LAMBDA_UTIL, "getAll", api::LAMBDA_UTIL_GET_ALL_DESC]
                [iface factory, "newEntryMessage", NEW_ENTRY_FORMAT]
                [ARETURN]
            },
            LambdaShape::EntryMessage => insn_list! {
                [ALOAD_1]
                [iface factory, "newEntryMessage", NEW_ENTRY_MESSAGE]
                [ARETURN]
            },
            LambdaShape::Exit => insn_list! {
                [ACONST_NULL]
                [ACONST_NULL]
                [iface factory, "newExitMessage", NEW_EXIT_FORMAT]
                [ARETURN]
            },
            LambdaShape::ExitResult => insn_list! {
                [ACONST_NULL]
                [ALOAD_1]
                [iface factory, "newExitMessage", NEW_EXIT_FORMAT]
                [ARETURN]
            },
            LambdaShape::ExitFormatResult => insn_list! {
                [ALOAD_1]
                [ALOAD_2]
                [iface factory, "newExitMessage", NEW_EXIT_FORMAT]
                [ARETURN]
            },
            LambdaShape::ExitEntry => insn_list! {
                [ALOAD_1]
                [iface factory, "newExitMessage", NEW_EXIT_ENTRY]
                [ARETURN]
            },
            LambdaShape::ExitEntryResult => insn_list! {
                [ALOAD_2]
                [ALOAD_1]
                [iface factory, "newExitMessage", NEW_EXIT_ENTRY_RESULT]
                [ARETURN]
            },
            LambdaShape::ExitMessageResult => insn_list! {
                [ALOAD_2]
                [ALOAD_1]
                [iface factory, "newExitMessage", NEW_EXIT_MESSAGE_RESULT]
                [ARETURN]
            },
            LambdaShape::Formatted => NodeList::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{argument_slots, parse_method_descriptor};
    use crate::insn::{AbstractInsnNode, Insn, MemberRef};

    #[test]
    fn test_every_shape_has_a_distinct_method() {
        let mut names: Vec<_> = LambdaShape::ALL.iter().map(|shape| shape.method_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), LambdaShape::ALL.len());
        for shape in LambdaShape::ALL {
            let (params, _) = parse_method_descriptor(&shape.descriptor()).unwrap();
            assert_eq!(params.len(), shape.captures().len());
            assert!(shape.factory_descriptor().ends_with("Lorg/apache/logging/log4j/util/Supplier;"));
        }
    }

    #[test]
    fn test_bodies_load_only_their_captures() {
        for shape in LambdaShape::ALL {
            let slots = argument_slots(&shape.descriptor()).unwrap();
            let body = shape.body();
            for node in body.nodes() {
                if let AbstractInsnNode::Insn(Insn::Simple(node)) = node
                    && (crate::opcodes::ALOAD_0..=crate::opcodes::ALOAD_3).contains(&node.opcode)
                {
                    assert!(((node.opcode - crate::opcodes::ALOAD_0) as u16) < slots, "{shape:?}");
                }
            }
            assert!(matches!(
                body.nodes().last(),
                Some(AbstractInsnNode::Insn(Insn::Simple(node))) if node.opcode == crate::opcodes::ARETURN
            ));
        }
    }

    #[test]
    fn test_formatted_builds_string_formatted_message() {
        let body = LambdaShape::Formatted.body();
        let calls: Vec<_> = body
            .nodes()
            .iter()
            .filter_map(|node| match node {
                AbstractInsnNode::Insn(Insn::Method(node)) => Some(&node.method_ref),
                _ => None,
            })
            .collect();
        assert!(matches!(
            calls.as_slice(),
            [MemberRef::Symbolic { owner, name, .. }]
                if owner == api::STRING_FORMATTED_MESSAGE && name == "<init>"
        ));
    }
}
