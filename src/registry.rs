//! Call-site pattern registry.
//!
//! Handlers are keyed by the owner of the invoked method. A handler either
//! returns a [`Recipe`] for an exact `(name, descriptor)` or `None`, in which
//! case the call is left as it is.

use std::collections::HashMap;
use std::fmt;

use crate::api;
use crate::descriptor::{FieldType, parse_method_descriptor};
use crate::shape::LambdaShape;

/// A value the rewritten call site reads back after spilling the original
/// receiver and arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Receiver,
    Param(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LevelSource {
    /// A fixed-level factory such as `atInfo()`.
    Fixed(&'static str),
    /// `atLevel(Level)` fed from an argument.
    Param(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerSource {
    Param(usize),
    /// `AbstractLogger.ENTRY_MARKER`
    Entry,
    /// `AbstractLogger.EXIT_MARKER`
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplyResult {
    /// `logAndGet`, with the result cast to `EntryMessage`.
    EntryMessage,
    /// `log(Supplier)`, nothing returned.
    Nothing,
    /// `log(Supplier)`, then the argument is returned as the call's value.
    Operand(Operand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    /// `LogBuilder.log(descriptor)` with the listed operands.
    Log {
        descriptor: String,
        args: Vec<Operand>,
    },
    /// `LogBuilder.log(Supplier)` or `logAndGet(Supplier)` with a shared
    /// supplier implementation.
    Supply {
        shape: LambdaShape,
        captures: Vec<Operand>,
        result: SupplyResult,
    },
}

/// A `Logger` call rebuilt as a `LogBuilder` chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainRecipe {
    pub level: LevelSource,
    pub marker: Option<MarkerSource>,
    pub throwable: Option<usize>,
    pub terminal: Terminal,
}

impl ChainRecipe {
    pub fn shape(&self) -> Option<LambdaShape> {
        match &self.terminal {
            Terminal::Supply { shape, .. } => Some(*shape),
            Terminal::Log { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipe {
    /// `withLocation()` becomes `withLocation(StackTraceElement)`.
    InjectLocation,
    BuilderChain(ChainRecipe),
}

impl Recipe {
    /// Whether the rewrite needs `invokedynamic` in the calling class.
    pub fn needs_indy(&self) -> bool {
        matches!(self, Recipe::BuilderChain(chain) if chain.shape().is_some())
    }
}

pub trait ConversionHandler: Send + Sync {
    fn recipe(&self, name: &str, descriptor: &str) -> Option<Recipe>;
}

impl<F> ConversionHandler for F
where
    F: Fn(&str, &str) -> Option<Recipe> + Send + Sync,
{
    fn recipe(&self, name: &str, descriptor: &str) -> Option<Recipe> {
        self(name, descriptor)
    }
}

#[derive(Default)]
pub struct Registry {
    handlers: HashMap<String, Box<dyn ConversionHandler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handlers for `Logger` and `LogBuilder`.
    pub fn log4j_api() -> Self {
        let mut registry = Self::new();
        registry.register(api::LOGGER, LoggerHandler);
        registry.register(api::LOG_BUILDER, LogBuilderHandler);
        registry
    }

    /// Replaces any handler already registered for `owner`.
    pub fn register<H>(&mut self, owner: &str, handler: H) -> &mut Self
    where
        H: ConversionHandler + 'static,
    {
        self.handlers.insert(owner.to_string(), Box::new(handler));
        self
    }

    pub fn dispatch(&self, owner: &str, name: &str, descriptor: &str) -> Option<Recipe> {
        self.handlers.get(owner)?.recipe(name, descriptor)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut owners: Vec<_> = self.handlers.keys().collect();
        owners.sort();
        f.debug_struct("Registry").field("owners", &owners).finish()
    }
}

/// `LogBuilder.withLocation()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogBuilderHandler;

impl ConversionHandler for LogBuilderHandler {
    fn recipe(&self, name: &str, descriptor: &str) -> Option<Recipe> {
        (name == api::WITH_LOCATION && descriptor == api::WITH_LOCATION_DESC)
            .then_some(Recipe::InjectLocation)
    }
}

/// Level methods, `log(Level, ...)`, flow methods and `printf` of `Logger`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggerHandler;

impl ConversionHandler for LoggerHandler {
    fn recipe(&self, name: &str, descriptor: &str) -> Option<Recipe> {
        let (params, ret) = parse_method_descriptor(descriptor).ok()?;
        let chain = match name {
            "traceEntry" => trace_entry(&params, &ret)?,
            "traceExit" => trace_exit(&params, &ret)?,
            "printf" => printf(&params, &ret)?,
            "log" => {
                if params.first() != Some(&object(api::LEVEL)) {
                    return None;
                }
                level_call(LevelSource::Param(0), &params, 1, &ret)?
            }
            _ => level_call(LevelSource::Fixed(api::builder_factory(name)?), &params, 0, &ret)?,
        };
        Some(Recipe::BuilderChain(chain))
    }
}

fn object(name: &str) -> FieldType {
    FieldType::Object(name.to_string())
}

fn array_of(name: &str) -> FieldType {
    FieldType::Array(format!("[L{name};"))
}

fn is_message_type(param: &FieldType) -> bool {
    [api::MESSAGE, api::CHAR_SEQUENCE, "java/lang/Object", "java/lang/String"]
        .iter()
        .any(|name| *param == object(name))
}

fn level_call(
    level: LevelSource,
    params: &[FieldType],
    mut next: usize,
    ret: &FieldType,
) -> Option<ChainRecipe> {
    if *ret != FieldType::Void {
        return None;
    }
    let mut marker = None;
    if params.get(next) == Some(&object(api::MARKER)) {
        marker = Some(MarkerSource::Param(next));
        next += 1;
    }
    let message = &params[next..];
    let string = object("java/lang/String");
    let throwable_type = object("java/lang/Throwable");
    let mut throwable = None;
    let message_len = match message {
        [single] if is_message_type(single) => 1,
        [first, second] if is_message_type(first) && *second == throwable_type => {
            throwable = Some(next + 1);
            1
        }
        [format, rest] if *format == string && *rest == array_of("java/lang/Object") => 2,
        [format, rest] if *format == string && *rest == array_of(api::SUPPLIER) => 2,
        [format, rest @ ..]
            if *format == string
                && (1..=10).contains(&rest.len())
                && rest.iter().all(|param| *param == object("java/lang/Object")) =>
        {
            message.len()
        }
        _ => return None,
    };
    let args: Vec<Operand> = (next..next + message_len).map(Operand::Param).collect();
    let descriptor = format!(
        "({})V",
        message[..message_len]
            .iter()
            .map(FieldType::descriptor)
            .collect::<String>()
    );
    Some(ChainRecipe {
        level,
        marker,
        throwable,
        terminal: Terminal::Log { descriptor, args },
    })
}

fn flow(marker: MarkerSource, shape: LambdaShape, captures: Vec<Operand>, result: SupplyResult) -> ChainRecipe {
    ChainRecipe {
        level: LevelSource::Fixed("atTrace"),
        marker: Some(marker),
        throwable: None,
        terminal: Terminal::Supply {
            shape,
            captures,
            result,
        },
    }
}

fn trace_entry(params: &[FieldType], ret: &FieldType) -> Option<ChainRecipe> {
    if *ret != object(api::ENTRY_MESSAGE) {
        return None;
    }
    let string = object("java/lang/String");
    let shape = match params {
        [] => LambdaShape::Entry,
        [format, args] if *format == string && *args == array_of("java/lang/Object") => {
            LambdaShape::EntryFormat
        }
        [suppliers] if *suppliers == array_of(api::SUPPLIER) => LambdaShape::EntrySuppliers,
        [format, suppliers] if *format == string && *suppliers == array_of(api::SUPPLIER) => {
            LambdaShape::EntryFormatSuppliers
        }
        [message] if *message == object(api::MESSAGE) => LambdaShape::EntryMessage,
        _ => return None,
    };
    let captures = std::iter::once(Operand::Receiver)
        .chain((0..params.len()).map(Operand::Param))
        .collect();
    Some(flow(MarkerSource::Entry, shape, captures, SupplyResult::EntryMessage))
}

fn trace_exit(params: &[FieldType], ret: &FieldType) -> Option<ChainRecipe> {
    let value = object("java/lang/Object");
    let (shape, result) = match (params, ret) {
        ([], FieldType::Void) => (LambdaShape::Exit, SupplyResult::Nothing),
        ([result], returned) if *result == value && *returned == value => {
            (LambdaShape::ExitResult, SupplyResult::Operand(Operand::Param(0)))
        }
        ([format, result], returned)
            if *format == object("java/lang/String") && *result == value && *returned == value =>
        {
            (LambdaShape::ExitFormatResult, SupplyResult::Operand(Operand::Param(1)))
        }
        ([entry], FieldType::Void) if *entry == object(api::ENTRY_MESSAGE) => {
            (LambdaShape::ExitEntry, SupplyResult::Nothing)
        }
        ([entry, result], returned)
            if *entry == object(api::ENTRY_MESSAGE) && *result == value && *returned == value =>
        {
            (LambdaShape::ExitEntryResult, SupplyResult::Operand(Operand::Param(1)))
        }
        ([message, result], returned)
            if *message == object(api::MESSAGE) && *result == value && *returned == value =>
        {
            (LambdaShape::ExitMessageResult, SupplyResult::Operand(Operand::Param(1)))
        }
        _ => return None,
    };
    let captures = std::iter::once(Operand::Receiver)
        .chain((0..params.len()).map(Operand::Param))
        .collect();
    Some(flow(MarkerSource::Exit, shape, captures, result))
}

fn printf(params: &[FieldType], ret: &FieldType) -> Option<ChainRecipe> {
    if *ret != FieldType::Void || params.first() != Some(&object(api::LEVEL)) {
        return None;
    }
    let (marker, format) = match params.get(1) {
        Some(param) if *param == object(api::MARKER) => (Some(MarkerSource::Param(1)), 2),
        _ => (None, 1),
    };
    if params.len() != format + 2
        || params[format] != object("java/lang/String")
        || params[format + 1] != array_of("java/lang/Object")
    {
        return None;
    }
    Some(ChainRecipe {
        level: LevelSource::Param(0),
        marker,
        throwable: None,
        terminal: Terminal::Supply {
            shape: LambdaShape::Formatted,
            captures: vec![Operand::Param(format), Operand::Param(format + 1)],
            result: SupplyResult::Nothing,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(registry: &Registry, name: &str, descriptor: &str) -> ChainRecipe {
        match registry.dispatch(api::LOGGER, name, descriptor) {
            Some(Recipe::BuilderChain(chain)) => chain,
            other => panic!("expected a chain for {name}{descriptor}, got {other:?}"),
        }
    }

    #[test]
    fn test_with_location_is_injected() {
        let registry = Registry::log4j_api();
        assert_eq!(
            registry.dispatch(api::LOG_BUILDER, "withLocation", api::WITH_LOCATION_DESC),
            Some(Recipe::InjectLocation)
        );
        assert_eq!(
            registry.dispatch(api::LOG_BUILDER, "withLocation", api::WITH_LOCATION_STE_DESC),
            None
        );
        assert_eq!(registry.dispatch("com/acme/Other", "withLocation", api::WITH_LOCATION_DESC), None);
    }

    #[test]
    fn test_level_methods_become_builder_chains() {
        let registry = Registry::log4j_api();
        let recipe = chain(&registry, "info", "(Ljava/lang/String;)V");
        assert_eq!(recipe.level, LevelSource::Fixed("atInfo"));
        assert_eq!(recipe.marker, None);
        assert_eq!(
            recipe.terminal,
            Terminal::Log {
                descriptor: "(Ljava/lang/String;)V".to_string(),
                args: vec![Operand::Param(0)],
            }
        );

        let recipe = chain(
            &registry,
            "error",
            "(Lorg/apache/logging/log4j/Marker;Ljava/lang/Object;Ljava/lang/Throwable;)V",
        );
        assert_eq!(recipe.marker, Some(MarkerSource::Param(0)));
        assert_eq!(recipe.throwable, Some(2));
        assert_eq!(
            recipe.terminal,
            Terminal::Log {
                descriptor: "(Ljava/lang/Object;)V".to_string(),
                args: vec![Operand::Param(1)],
            }
        );

        let recipe = chain(
            &registry,
            "log",
            "(Lorg/apache/logging/log4j/Level;Ljava/lang/String;Ljava/lang/Object;Ljava/lang/Object;)V",
        );
        assert_eq!(recipe.level, LevelSource::Param(0));
        assert_eq!(
            recipe.terminal,
            Terminal::Log {
                descriptor: "(Ljava/lang/String;Ljava/lang/Object;Ljava/lang/Object;)V".to_string(),
                args: vec![Operand::Param(1), Operand::Param(2), Operand::Param(3)],
            }
        );
    }

    #[test]
    fn test_unrecognized_descriptors_pass_through() {
        let registry = Registry::log4j_api();
        for (name, descriptor) in [
            ("info", "(Lorg/apache/logging/log4j/util/Supplier;)V"),
            ("info", "(Lorg/apache/logging/log4j/util/MessageSupplier;)V"),
            ("info", "(Ljava/lang/String;I)V"),
            ("isInfoEnabled", "()Z"),
            ("log", "(Ljava/lang/String;)V"),
            ("catching", "(Ljava/lang/Throwable;)V"),
            ("traceEntry", "(Ljava/lang/String;)Lorg/apache/logging/log4j/message/EntryMessage;"),
            ("info", "broken"),
        ] {
            assert_eq!(registry.dispatch(api::LOGGER, name, descriptor), None, "{name}{descriptor}");
        }
        let eleven = format!("(Ljava/lang/String;{})V", "Ljava/lang/Object;".repeat(11));
        assert_eq!(registry.dispatch(api::LOGGER, "info", &eleven), None);
        let ten = format!("(Ljava/lang/String;{})V", "Ljava/lang/Object;".repeat(10));
        assert!(registry.dispatch(api::LOGGER, "info", &ten).is_some());
    }

    #[test]
    fn test_flow_methods_use_shapes() {
        let registry = Registry::log4j_api();
        let recipe = chain(
            &registry,
            "traceEntry",
            "(Ljava/lang/String;[Ljava/lang/Object;)Lorg/apache/logging/log4j/message/EntryMessage;",
        );
        assert_eq!(recipe.marker, Some(MarkerSource::Entry));
        assert_eq!(
            recipe.terminal,
            Terminal::Supply {
                shape: LambdaShape::EntryFormat,
                captures: vec![Operand::Receiver, Operand::Param(0), Operand::Param(1)],
                result: SupplyResult::EntryMessage,
            }
        );

        let recipe = chain(&registry, "traceExit", "(Ljava/lang/Object;)Ljava/lang/Object;");
        assert_eq!(recipe.shape(), Some(LambdaShape::ExitResult));
        assert!(Recipe::BuilderChain(recipe).needs_indy());

        let recipe = chain(
            &registry,
            "printf",
            "(Lorg/apache/logging/log4j/Level;Lorg/apache/logging/log4j/Marker;Ljava/lang/String;[Ljava/lang/Object;)V",
        );
        assert_eq!(recipe.marker, Some(MarkerSource::Param(1)));
        assert_eq!(recipe.shape(), Some(LambdaShape::Formatted));
    }

    #[test]
    fn test_register_accepts_closures() {
        let mut registry = Registry::new();
        registry.register("com/acme/Audit", |name: &str, _: &str| {
            (name == "here").then_some(Recipe::InjectLocation)
        });
        assert_eq!(
            registry.dispatch("com/acme/Audit", "here", "()V"),
            Some(Recipe::InjectLocation)
        );
        assert_eq!(registry.dispatch("com/acme/Audit", "there", "()V"), None);
    }
}
