//! Location method rewriter.
//!
//! Walks one decoded method body in order, keeps the last line number seen,
//! and replaces every invoke the registry recognises. Rewritten call sites
//! spill their receiver and arguments into fresh locals above the method's
//! original `max_locals` and rebuild the call as a `LogBuilder` chain.

use tracing::trace;

use crate::api;
use crate::builder::ConstantPoolBuilder;
use crate::cache::{LocationCache, LocationRecord};
use crate::class_reader::{CpInfo, cp_member_ref};
use crate::descriptor::{FieldType, parse_method_descriptor};
use crate::error::{ClassReadError, ConvertError};
use crate::insn::{
    AbstractInsnNode, FieldInsnNode, Insn, InsnList, InsnNode, InvokeDynamicInsnNode,
    InvokeInterfaceInsnNode, MemberRef, NodeList, TypeInsnNode,
};
use crate::naming;
use crate::nodes::MethodBody;
use crate::opcodes;
use crate::registry::{
    ChainRecipe, LevelSource, MarkerSource, Operand, Recipe, Registry, SupplyResult, Terminal,
};

/// What a method rewrite needs to know about its class and batch.
pub struct MethodContext<'a> {
    /// Internal name of the class being converted.
    pub class_name: &'a str,
    pub method_name: &'a str,
    pub source_file: Option<&'a str>,
    pub registry: &'a Registry,
    pub cache: &'a LocationCache,
}

/// `(owner, name, descriptor)` of an invoke the registry may know about.
/// Static and special invokes are never rewritten.
pub(crate) fn invoked_member<'a>(
    insn: &'a Insn,
    pool: &'a [CpInfo],
) -> Result<Option<(&'a str, &'a str, &'a str)>, ClassReadError> {
    let member = match insn {
        Insn::Method(node) if node.insn.opcode == opcodes::INVOKEVIRTUAL => &node.method_ref,
        Insn::InvokeInterface(node) => &node.method_ref,
        _ => return Ok(None),
    };
    match member {
        MemberRef::Index(index) => cp_member_ref(pool, *index).map(Some),
        MemberRef::Symbolic {
            owner,
            name,
            descriptor,
        } => Ok(Some((owner.as_str(), name.as_str(), descriptor.as_str()))),
    }
}

/// Rewrites every recognised call site in `body` and returns how many were
/// rewritten. New constants go to `cp`; locations and shapes go to the cache.
pub fn rewrite_method(
    ctx: &MethodContext<'_>,
    body: &mut MethodBody,
    cp: &mut ConstantPoolBuilder,
) -> Result<usize, ConvertError> {
    let nodes = std::mem::take(&mut body.instructions).into_nodes();
    let mut rewritten = NodeList::new();
    let mut line = None;
    let mut count = 0usize;
    let spill_base = body.max_locals;

    for node in nodes {
        let insn = match node {
            AbstractInsnNode::LineNumber(entry) => {
                line = Some(entry.line);
                rewritten.add(entry);
                continue;
            }
            AbstractInsnNode::Insn(insn) => insn,
            label => {
                rewritten.add(label);
                continue;
            }
        };
        let call = invoked_member(&insn, cp.pool())
            .map_err(|source| malformed(ctx, source))?
            .map(|(owner, name, descriptor)| {
                (owner.to_string(), name.to_string(), descriptor.to_string())
            });
        let Some((owner, name, descriptor)) = call else {
            rewritten.add(insn);
            continue;
        };
        let Some(recipe) = ctx.registry.dispatch(&owner, &name, &descriptor) else {
            rewritten.add(insn);
            continue;
        };

        let record = location(ctx, line)?;
        let line_number = record.line;
        let index = ctx.cache.add_location(ctx.class_name, record);
        trace!(
            class = ctx.class_name,
            method = ctx.method_name,
            owner = %owner,
            name = %name,
            descriptor = %descriptor,
            line = line_number,
            index,
            "rewriting call site"
        );
        let replacement = match recipe {
            Recipe::InjectLocation => location_element(ctx.class_name, index),
            Recipe::BuilderChain(chain) => {
                let call = CallSite {
                    ctx,
                    descriptor: &descriptor,
                    index,
                    spill_base,
                };
                call.builder_chain(&chain, cp)?
            }
        };
        rewritten.append(replacement);
        count += 1;
    }

    body.instructions = rewritten;
    Ok(count)
}

fn malformed(ctx: &MethodContext<'_>, source: ClassReadError) -> ConvertError {
    ConvertError::Malformed {
        class: Some(ctx.class_name.to_string()),
        source,
    }
}

fn location(ctx: &MethodContext<'_>, line: Option<u16>) -> Result<LocationRecord, ConvertError> {
    let missing = |reason| ConvertError::MissingDebugInfo {
        class: ctx.class_name.to_string(),
        method: ctx.method_name.to_string(),
        reason,
    };
    let file_name = ctx.source_file.ok_or_else(|| missing("no SourceFile attribute"))?;
    let line = line.ok_or_else(|| missing("call site has no line number"))?;
    Ok(LocationRecord {
        class_name: naming::binary_name(ctx.class_name),
        method_name: ctx.method_name.to_string(),
        file_name: file_name.to_string(),
        line,
    })
}

/// `Cache.locations[index]` passed to `withLocation(StackTraceElement)`.
fn location_element(class_name: &str, index: usize) -> NodeList {
    let mut list = InsnList::new();
    list.add(FieldInsnNode::new(
        opcodes::GETSTATIC,
        &naming::cache_class_name(class_name),
        api::LOCATIONS_FIELD,
        api::LOCATIONS_DESC,
    ));
    list.push_int(index as i32);
    list.add(InsnNode {
        opcode: opcodes::AALOAD,
    });
    list.add(builder_call(api::WITH_LOCATION, api::WITH_LOCATION_STE_DESC));
    list.into()
}

fn builder_call(name: &str, descriptor: &str) -> InvokeInterfaceInsnNode {
    InvokeInterfaceInsnNode::new(api::LOG_BUILDER, name, descriptor)
}

struct CallSite<'a> {
    ctx: &'a MethodContext<'a>,
    descriptor: &'a str,
    index: usize,
    spill_base: u16,
}

struct Spilled {
    receiver: u16,
    params: Vec<(u16, FieldType)>,
}

impl Spilled {
    fn load(&self, list: &mut InsnList, operand: Operand) {
        match operand {
            Operand::Receiver => list.var(opcodes::ALOAD, self.receiver),
            Operand::Param(i) => {
                let (slot, param) = &self.params[i];
                list.var(param.load_opcode(), *slot)
            }
        };
    }
}

impl CallSite<'_> {
    fn builder_chain(
        &self,
        chain: &ChainRecipe,
        cp: &mut ConstantPoolBuilder,
    ) -> Result<NodeList, ConvertError> {
        let (params, _) = parse_method_descriptor(self.descriptor)
            .map_err(|source| malformed(self.ctx, source))?;
        let mut list = InsnList::new();

        let mut next = self.spill_base + 1;
        let mut slots = Vec::with_capacity(params.len());
        for param in params {
            let size = param.size();
            slots.push((next, param));
            next += size;
        }
        let spilled = Spilled {
            receiver: self.spill_base,
            params: slots,
        };
        for (slot, param) in spilled.params.iter().rev() {
            list.var(param.store_opcode(), *slot);
        }
        list.var(opcodes::ASTORE, spilled.receiver);

        list.var(opcodes::ALOAD, spilled.receiver);
        match &chain.level {
            LevelSource::Fixed(factory) => {
                list.add(InvokeInterfaceInsnNode::new(
                    api::LOGGER,
                    factory,
                    api::AT_FIXED_LEVEL_DESC,
                ));
            }
            LevelSource::Param(i) => {
                spilled.load(&mut list, Operand::Param(*i));
                list.add(InvokeInterfaceInsnNode::new(
                    api::LOGGER,
                    "atLevel",
                    api::AT_LEVEL_DESC,
                ));
            }
        }

        if let Some(marker) = chain.marker {
            match marker {
                MarkerSource::Param(i) => spilled.load(&mut list, Operand::Param(i)),
                MarkerSource::Entry | MarkerSource::Exit => {
                    let field = if marker == MarkerSource::Entry {
                        api::ENTRY_MARKER
                    } else {
                        api::EXIT_MARKER
                    };
                    list.add(FieldInsnNode::new(
                        opcodes::GETSTATIC,
                        api::ABSTRACT_LOGGER,
                        field,
                        api::MARKER_DESC,
                    ));
                }
            }
            list.add(builder_call("withMarker", api::WITH_MARKER_DESC));
        }

        let mut list = NodeList::from(list);
        list.append(location_element(self.ctx.class_name, self.index));
        let mut list_tail = InsnList::new();

        if let Some(throwable) = chain.throwable {
            spilled.load(&mut list_tail, Operand::Param(throwable));
            list_tail.add(builder_call("withThrowable", api::WITH_THROWABLE_DESC));
        }

        match &chain.terminal {
            Terminal::Log { descriptor, args } => {
                for arg in args {
                    spilled.load(&mut list_tail, *arg);
                }
                list_tail.add(builder_call("log", descriptor));
            }
            Terminal::Supply {
                shape,
                captures,
                result,
            } => {
                let target = self.ctx.cache.request_shape(self.ctx.class_name, *shape);
                for capture in captures {
                    spilled.load(&mut list_tail, *capture);
                }
                let bootstrap = cp.static_method_handle(
                    api::LAMBDA_METAFACTORY,
                    api::METAFACTORY,
                    api::METAFACTORY_DESC,
                );
                let arguments = vec![
                    cp.method_type(api::SUPPLIER_GET_ERASED_DESC),
                    cp.static_method_handle(&target.owner, target.name, &target.descriptor),
                    cp.method_type(api::SUPPLIER_GET_MESSAGE_DESC),
                ];
                let bootstrap_index = cp.bootstrap_method(bootstrap, arguments);
                let method_index =
                    cp.invoke_dynamic(bootstrap_index, api::SUPPLIER_GET, &shape.factory_descriptor());
                list_tail.add(InvokeDynamicInsnNode {
                    insn: InsnNode {
                        opcode: opcodes::INVOKEDYNAMIC,
                    },
                    method_index,
                });
                match result {
                    SupplyResult::EntryMessage => {
                        list_tail.add(builder_call("logAndGet", api::LOG_AND_GET_DESC));
                        list_tail.add(TypeInsnNode::new(opcodes::CHECKCAST, api::ENTRY_MESSAGE));
                    }
                    SupplyResult::Nothing => {
                        list_tail.add(builder_call("log", api::LOG_SUPPLIER_DESC));
                    }
                    SupplyResult::Operand(operand) => {
                        list_tail.add(builder_call("log", api::LOG_SUPPLIER_DESC));
                        spilled.load(&mut list_tail, *operand);
                    }
                }
            }
        }
        list.extend(list_tail);
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::assemble;
    use crate::class_reader::decode_instructions;
    use crate::frames::{FrameMethod, analyze};
    use crate::hierarchy::BootstrapClasses;
    use crate::shape::LambdaShape;

    fn body(instructions: NodeList, max_locals: u16) -> MethodBody {
        MethodBody {
            instructions,
            try_catch_blocks: Vec::new(),
            local_variables: Vec::new(),
            local_variable_types: Vec::new(),
            max_stack: 2,
            max_locals,
        }
    }

    fn context<'a>(
        registry: &'a Registry,
        cache: &'a LocationCache,
        source_file: Option<&'a str>,
    ) -> MethodContext<'a> {
        MethodContext {
            class_name: "com/acme/Foo$Inner",
            method_name: "run",
            source_file,
            registry,
            cache,
        }
    }

    fn invoked(list: &NodeList, cp: &ConstantPoolBuilder) -> Vec<(String, String)> {
        list.nodes()
            .iter()
            .filter_map(|node| match node {
                AbstractInsnNode::Insn(insn) => invoked_member(insn, cp.pool()).unwrap(),
                _ => None,
            })
            .map(|(owner, name, _)| (owner.to_string(), name.to_string()))
            .collect()
    }

    #[test]
    fn test_with_location_reads_cache_slot() {
        let registry = Registry::log4j_api();
        let cache = LocationCache::new();
        let mut method = body(
            insn_list! {
                [label 0]
                [line 42, 0]
                [var ALOAD 1]
                [iface api::LOG_BUILDER, "withLocation", api::WITH_LOCATION_DESC]
                [POP]
                [RETURN]
            },
            2,
        );
        let mut cp = ConstantPoolBuilder::new();
        let count = rewrite_method(&context(&registry, &cache, Some("Foo.java")), &mut method, &mut cp)
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            cache.locations("com/acme/Foo"),
            vec![LocationRecord {
                class_name: "com.acme.Foo$Inner".to_string(),
                method_name: "run".to_string(),
                file_name: "Foo.java".to_string(),
                line: 42,
            }]
        );
        let nodes = method.instructions.nodes();
        assert!(matches!(
            &nodes[3],
            AbstractInsnNode::Insn(Insn::Field(node))
                if matches!(&node.field_ref, MemberRef::Symbolic { owner, .. } if owner == "com/acme/Foo$$Log4j2$$Cache")
        ));
        assert_eq!(
            invoked(&method.instructions, &cp),
            vec![(api::LOG_BUILDER.to_string(), "withLocation".to_string())]
        );
    }

    #[test]
    fn test_logger_call_becomes_builder_chain() {
        let registry = Registry::log4j_api();
        let cache = LocationCache::new();
        let mut method = body(
            insn_list! {
                [label 0]
                [line 7, 0]
                [var ALOAD 0]
                [ldc "hello {}"]
                [var ALOAD 0]
                [iface api::LOGGER, "info", "(Ljava/lang/String;Ljava/lang/Object;)V"]
                [RETURN]
            },
            1,
        );
        let mut cp = ConstantPoolBuilder::new();
        rewrite_method(&context(&registry, &cache, Some("Foo.java")), &mut method, &mut cp).unwrap();
        assert_eq!(
            invoked(&method.instructions, &cp),
            vec![
                (api::LOGGER.to_string(), "atInfo".to_string()),
                (api::LOG_BUILDER.to_string(), "withLocation".to_string()),
                (api::LOG_BUILDER.to_string(), "log".to_string()),
            ]
        );

        let code = assemble(&method, &mut cp).unwrap();
        let frame_method = FrameMethod {
            class_name: "com/acme/Foo$Inner",
            access_flags: crate::constants::ACC_STATIC,
            name: "run",
            descriptor: "(Lorg/apache/logging/log4j/Logger;)V",
        };
        let analysis = analyze(&frame_method, &code, &mut cp, &BootstrapClasses, true).unwrap();
        // receiver in 1, format in 2, argument in 3
        assert_eq!(analysis.max_locals, 4);
        assert_eq!(analysis.max_stack, 3);
    }

    #[test]
    fn test_flow_call_uses_shared_supplier() {
        let registry = Registry::log4j_api();
        let cache = LocationCache::new();
        let mut method = body(
            insn_list! {
                [label 0]
                [line 9, 0]
                [var ALOAD 0]
                [var ALOAD 1]
                [iface api::LOGGER, "traceExit", "(Ljava/lang/Object;)Ljava/lang/Object;"]
                [ARETURN]
            },
            2,
        );
        let mut cp = ConstantPoolBuilder::new();
        rewrite_method(&context(&registry, &cache, Some("Foo.java")), &mut method, &mut cp).unwrap();
        let indy = method.instructions.nodes().iter().find_map(|node| match node {
            AbstractInsnNode::Insn(Insn::InvokeDynamic(node)) => Some(node.method_index),
            _ => None,
        });
        let (name, descriptor) =
            crate::class_reader::cp_invoke_dynamic(cp.pool(), indy.unwrap()).unwrap();
        assert_eq!(name, "get");
        assert_eq!(descriptor, LambdaShape::ExitResult.factory_descriptor());
        let code = assemble(&method, &mut cp).unwrap();
        let insns = decode_instructions(&code.code).unwrap();
        assert!(matches!(
            insns.last(),
            Some((_, Insn::Simple(node))) if node.opcode == opcodes::ARETURN
        ));
        let (_, bootstrap_methods) = cp.finish().unwrap();
        assert_eq!(bootstrap_methods.len(), 1);
        assert_eq!(bootstrap_methods[0].bootstrap_arguments.len(), 3);
    }

    #[test]
    fn test_missing_source_file_is_fatal() {
        let registry = Registry::log4j_api();
        let cache = LocationCache::new();
        let mut method = body(
            insn_list! {
                [label 0]
                [line 3, 0]
                [var ALOAD 1]
                [iface api::LOG_BUILDER, "withLocation", api::WITH_LOCATION_DESC]
                [RETURN]
            },
            2,
        );
        let mut cp = ConstantPoolBuilder::new();
        let err = rewrite_method(&context(&registry, &cache, None), &mut method, &mut cp).unwrap_err();
        assert!(matches!(err, ConvertError::MissingDebugInfo { ref method, .. } if method == "run"));
        assert!(cache.group_keys().is_empty());
    }

    #[test]
    fn test_missing_line_is_fatal_and_unknown_calls_pass_through() {
        let registry = Registry::log4j_api();
        let cache = LocationCache::new();
        let mut untouched = body(
            insn_list! {
                [var ALOAD 0]
                [iface api::LOGGER, "info", "(Lorg/apache/logging/log4j/util/Supplier;)V"]
                [RETURN]
            },
            1,
        );
        let before = untouched.instructions.clone();
        let mut cp = ConstantPoolBuilder::new();
        let count = rewrite_method(&context(&registry, &cache, Some("Foo.java")), &mut untouched, &mut cp)
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(untouched.instructions.nodes(), before.nodes());

        let mut method = body(
            insn_list! {
                [var ALOAD 0]
                [ldc "x"]
                [iface api::LOGGER, "info", "(Ljava/lang/String;)V"]
                [RETURN]
            },
            1,
        );
        let err = rewrite_method(&context(&registry, &cache, Some("Foo.java")), &mut method, &mut cp)
            .unwrap_err();
        assert!(matches!(err, ConvertError::MissingDebugInfo { .. }));
    }
}
