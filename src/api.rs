//! Names and descriptors of the Log4j API surface touched by the rewrite.

pub const LOGGER: &str = "org/apache/logging/log4j/Logger";
pub const LOG_BUILDER: &str = "org/apache/logging/log4j/LogBuilder";
pub const LEVEL: &str = "org/apache/logging/log4j/Level";
pub const MARKER: &str = "org/apache/logging/log4j/Marker";
pub const ABSTRACT_LOGGER: &str = "org/apache/logging/log4j/spi/AbstractLogger";
pub const MESSAGE: &str = "org/apache/logging/log4j/message/Message";
pub const ENTRY_MESSAGE: &str = "org/apache/logging/log4j/message/EntryMessage";
pub const FLOW_MESSAGE_FACTORY: &str = "org/apache/logging/log4j/message/FlowMessageFactory";
pub const STRING_FORMATTED_MESSAGE: &str = "org/apache/logging/log4j/message/StringFormattedMessage";
pub const SUPPLIER: &str = "org/apache/logging/log4j/util/Supplier";
pub const LAMBDA_UTIL: &str = "org/apache/logging/log4j/util/LambdaUtil";

pub const STACK_TRACE_ELEMENT: &str = "java/lang/StackTraceElement";
pub const CHAR_SEQUENCE: &str = "java/lang/CharSequence";
pub const LAMBDA_METAFACTORY: &str = "java/lang/invoke/LambdaMetafactory";

pub const ENTRY_MARKER: &str = "ENTRY_MARKER";
pub const EXIT_MARKER: &str = "EXIT_MARKER";
pub const MARKER_DESC: &str = "Lorg/apache/logging/log4j/Marker;";

pub const WITH_LOCATION: &str = "withLocation";
pub const WITH_LOCATION_DESC: &str = "()Lorg/apache/logging/log4j/LogBuilder;";
pub const WITH_LOCATION_STE_DESC: &str =
    "(Ljava/lang/StackTraceElement;)Lorg/apache/logging/log4j/LogBuilder;";
pub const WITH_MARKER_DESC: &str =
    "(Lorg/apache/logging/log4j/Marker;)Lorg/apache/logging/log4j/LogBuilder;";
pub const WITH_THROWABLE_DESC: &str =
    "(Ljava/lang/Throwable;)Lorg/apache/logging/log4j/LogBuilder;";
pub const AT_LEVEL_DESC: &str = "(Lorg/apache/logging/log4j/Level;)Lorg/apache/logging/log4j/LogBuilder;";
pub const AT_FIXED_LEVEL_DESC: &str = "()Lorg/apache/logging/log4j/LogBuilder;";
pub const LOG_SUPPLIER_DESC: &str = "(Lorg/apache/logging/log4j/util/Supplier;)V";
pub const LOG_AND_GET_DESC: &str =
    "(Lorg/apache/logging/log4j/util/Supplier;)Lorg/apache/logging/log4j/message/Message;";

pub const GET_FLOW_MESSAGE_FACTORY_DESC: &str =
    "()Lorg/apache/logging/log4j/message/FlowMessageFactory;";
pub const LAMBDA_UTIL_GET_ALL_DESC: &str =
    "([Lorg/apache/logging/log4j/util/Supplier;)[Ljava/lang/Object;";

/// The `static final StackTraceElement[]` of every cache class.
pub const LOCATIONS_FIELD: &str = "locations";
pub const LOCATIONS_DESC: &str = "[Ljava/lang/StackTraceElement;";
pub const STACK_TRACE_ELEMENT_INIT_DESC: &str =
    "(Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;I)V";

pub const METAFACTORY: &str = "metafactory";
pub const METAFACTORY_DESC: &str = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodHandle;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/CallSite;";
/// Erased signature of `Supplier.get`.
pub const SUPPLIER_GET: &str = "get";
pub const SUPPLIER_GET_ERASED_DESC: &str = "()Ljava/lang/Object;";
pub const SUPPLIER_GET_MESSAGE_DESC: &str = "()Lorg/apache/logging/log4j/message/Message;";

/// `Logger` level methods and the `LogBuilder` factory each maps to.
pub const LEVEL_METHODS: [(&str, &str); 6] = [
    ("trace", "atTrace"),
    ("debug", "atDebug"),
    ("info", "atInfo"),
    ("warn", "atWarn"),
    ("error", "atError"),
    ("fatal", "atFatal"),
];

pub fn builder_factory(level_method: &str) -> Option<&'static str> {
    LEVEL_METHODS
        .iter()
        .find(|(name, _)| *name == level_method)
        .map(|(_, factory)| *factory)
}
