//! Per-class conversion: parse, rewrite recognised call sites, recompute
//! frames and serialize.

use tracing::debug;

use crate::batch::BatchContext;
use crate::builder::{ConstantPoolBuilder, assemble};
use crate::class_reader::{
    AttributeInfo, BootstrapMethod, ClassFile, cp_utf8, decode_instructions, peek_class_name,
    read_class_file, read_method_body,
};
use crate::class_writer::write_class_file;
use crate::constants;
use crate::error::{ClassReadError, ConvertError};
use crate::frames::{self, FrameMethod};
use crate::hierarchy::{ClassInfo, Overlay};
use crate::naming;
use crate::registry::Registry;
use crate::rewriter::{MethodContext, invoked_member, rewrite_method};

/// Result of converting one class.
#[derive(Debug, Clone)]
pub struct Converted {
    /// Internal name of the converted class.
    pub class_name: String,
    /// Cache class group the call sites were recorded in, if any.
    pub group: Option<String>,
    pub call_sites: usize,
    pub bytes: Vec<u8>,
}

impl Converted {
    pub fn is_rewritten(&self) -> bool {
        self.call_sites > 0
    }
}

/// Methods with at least one recognised call site.
struct Scan {
    methods: Vec<usize>,
    needs_indy: bool,
}

fn scan(class_file: &ClassFile, registry: &Registry) -> Result<Scan, ClassReadError> {
    let mut methods = Vec::new();
    let mut needs_indy = false;
    for (index, method) in class_file.methods.iter().enumerate() {
        let Some(code) = method.code() else {
            continue;
        };
        let mut matched = false;
        for (_, insn) in decode_instructions(&code.code)? {
            let Some((owner, name, descriptor)) = invoked_member(&insn, &class_file.constant_pool)?
            else {
                continue;
            };
            if let Some(recipe) = registry.dispatch(owner, name, descriptor) {
                matched = true;
                needs_indy |= recipe.needs_indy();
            }
        }
        if matched {
            methods.push(index);
        }
    }
    Ok(Scan {
        methods,
        needs_indy,
    })
}

fn class_info(class_file: &ClassFile) -> Result<ClassInfo, ClassReadError> {
    let super_name = match class_file.super_class {
        0 => None,
        index => Some(class_file.class_name(index)?.to_string()),
    };
    let interfaces = class_file
        .interfaces
        .iter()
        .map(|index| class_file.class_name(*index).map(str::to_string))
        .collect::<Result<_, _>>()?;
    Ok(ClassInfo {
        name: class_file.this_class_name()?.to_string(),
        super_name,
        interfaces,
        is_interface: class_file.access_flags & constants::ACC_INTERFACE != 0,
    })
}

fn set_bootstrap_methods(attributes: &mut Vec<AttributeInfo>, methods: Vec<BootstrapMethod>) {
    for attr in attributes.iter_mut() {
        if let AttributeInfo::BootstrapMethods { methods: existing } = attr {
            *existing = methods;
            return;
        }
    }
    if !methods.is_empty() {
        attributes.push(AttributeInfo::BootstrapMethods { methods });
    }
}

fn is_rebuilt(attr: &AttributeInfo) -> bool {
    matches!(
        attr,
        AttributeInfo::LineNumberTable { .. }
            | AttributeInfo::LocalVariableTable { .. }
            | AttributeInfo::LocalVariableTypeTable { .. }
            | AttributeInfo::StackMapTable { .. }
    )
}

/// Converts one class file. Classes without a recognised call site come back
/// byte for byte.
///
/// Location records are added to the batch cache while methods are
/// rewritten, so a class that fails part way may leave records behind.
pub fn convert(input: &[u8], ctx: &BatchContext) -> Result<Converted, ConvertError> {
    let _ticket = ctx.begin();
    let mut class_file = read_class_file(input).map_err(|source| ConvertError::Malformed {
        class: peek_class_name(input),
        source,
    })?;
    let class_name = class_file
        .this_class_name()
        .map_err(|source| ConvertError::Malformed {
            class: None,
            source,
        })?
        .to_string();
    let malformed = |source| ConvertError::Malformed {
        class: Some(class_name.clone()),
        source,
    };
    let write = |source| ConvertError::write(&class_name, source);

    let scan = scan(&class_file, ctx.registry()).map_err(malformed)?;
    if scan.methods.is_empty() {
        debug!(class = %class_name, "no call sites");
        return Ok(Converted {
            class_name,
            group: None,
            call_sites: 0,
            bytes: input.to_vec(),
        });
    }
    if scan.needs_indy && class_file.major_version < constants::V1_7 {
        return Err(ConvertError::UnsupportedVersion {
            class: class_name,
            major: class_file.major_version,
        });
    }

    let source_file = class_file.source_file().map_err(malformed)?.map(str::to_string);
    let hierarchy = Overlay::new(class_info(&class_file).map_err(malformed)?, ctx.hierarchy());
    let major_version = class_file.major_version;
    let bootstrap_methods = class_file.bootstrap_methods().to_vec();
    let mut cp = ConstantPoolBuilder::from_pool(
        std::mem::take(&mut class_file.constant_pool),
        bootstrap_methods,
    );

    let mut call_sites = 0;
    for index in scan.methods {
        let method = &mut class_file.methods[index];
        let name = cp_utf8(cp.pool(), method.name_index)
            .map_err(malformed)?
            .to_string();
        let descriptor = cp_utf8(cp.pool(), method.descriptor_index)
            .map_err(malformed)?
            .to_string();
        let access_flags = method.access_flags;
        let Some(code) = method.code_mut() else {
            continue;
        };

        let mut body = read_method_body(code).map_err(malformed)?;
        let dropped: Vec<&str> = code
            .attributes
            .iter()
            .filter(|attr| !is_rebuilt(attr))
            .map(AttributeInfo::name)
            .collect();
        if !dropped.is_empty() {
            debug!(class = %class_name, method = %name, ?dropped, "dropping code attributes");
        }

        let method_ctx = MethodContext {
            class_name: &class_name,
            method_name: &name,
            source_file: source_file.as_deref(),
            registry: ctx.registry(),
            cache: ctx.cache(),
        };
        call_sites += rewrite_method(&method_ctx, &mut body, &mut cp)?;

        let mut rebuilt = assemble(&body, &mut cp).map_err(write)?;
        let frame_method = FrameMethod {
            class_name: &class_name,
            access_flags,
            name: &name,
            descriptor: &descriptor,
        };
        frames::recompute(&frame_method, &mut rebuilt, &mut cp, &hierarchy, major_version)
            .map_err(write)?;
        *code = rebuilt;
    }

    let (pool, bootstrap_methods) = cp.finish().map_err(write)?;
    class_file.constant_pool = pool;
    set_bootstrap_methods(&mut class_file.attributes, bootstrap_methods);
    let bytes = write_class_file(&class_file).map_err(write)?;

    let group = naming::top_level_name(&class_name).to_string();
    debug!(class = %class_name, %group, call_sites, "converted");
    Ok(Converted {
        class_name,
        group: Some(group),
        call_sites,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use rayon::prelude::*;

    use super::*;
    use crate::api;
    use crate::builder::{ClassBuilder, MethodBuilder};
    use crate::class_reader::{CpInfo, cp_member_ref};
    use crate::error::HierarchyError;
    use crate::hierarchy::{BootstrapClasses, ClassHierarchy};
    use crate::insn::{Insn, MemberRef};
    use crate::opcodes;

    const RUN_DESC: &str = "(Lorg/apache/logging/log4j/Logger;)V";

    fn context() -> BatchContext {
        BatchContext::new(Registry::log4j_api(), BootstrapClasses)
    }

    fn info_method(name: &str, line_number: u16) -> MethodBuilder {
        let mut method = MethodBuilder::new(constants::ACC_STATIC, name, RUN_DESC);
        method.code(insn_list! {
            [label 0]
            [line line_number, 0]
            [var ALOAD 0]
            [ldc "message"]
            [iface api::LOGGER, "info", "(Ljava/lang/String;)V"]
            [RETURN]
        });
        method
    }

    fn exit_method(name: &str, line_number: u16) -> MethodBuilder {
        let mut method = MethodBuilder::new(constants::ACC_STATIC, name, RUN_DESC);
        method.code(insn_list! {
            [label 0]
            [line line_number, 0]
            [var ALOAD 0]
            [ldc "result"]
            [iface api::LOGGER, "traceExit", "(Ljava/lang/Object;)Ljava/lang/Object;"]
            [POP]
            [RETURN]
        });
        method
    }

    fn class_bytes(name: &str, source_file: Option<&str>, methods: Vec<MethodBuilder>) -> Vec<u8> {
        let mut builder = ClassBuilder::new(name, constants::JAVA_LANG_OBJECT);
        if let Some(source_file) = source_file {
            builder.source_file(source_file);
        }
        for method in methods {
            builder.add_method(method);
        }
        write_class_file(&builder.build(&BootstrapClasses).unwrap()).unwrap()
    }

    fn method_names(class_file: &ClassFile) -> Vec<String> {
        class_file
            .methods
            .iter()
            .map(|method| class_file.cp_utf8(method.name_index).unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_single_call_site_reads_slot_zero() {
        let ctx = context();
        let input = class_bytes("com/acme/Foo", Some("Foo.java"), vec![info_method("run", 42)]);
        let converted = convert(&input, &ctx).unwrap();
        assert_eq!(converted.call_sites, 1);
        assert_eq!(converted.group.as_deref(), Some("com/acme/Foo"));

        let parsed = read_class_file(&converted.bytes).unwrap();
        assert_eq!(method_names(&parsed), vec!["run"]);
        let code = parsed.methods[0].code().unwrap();
        let insns = decode_instructions(&code.code).unwrap();
        let position = insns
            .iter()
            .position(|(_, insn)| match insn {
                Insn::Field(node) if node.insn.opcode == opcodes::GETSTATIC => match &node.field_ref {
                    MemberRef::Index(index) => {
                        cp_member_ref(&parsed.constant_pool, *index).unwrap()
                            == ("com/acme/Foo$$Log4j2$$Cache", "locations", api::LOCATIONS_DESC)
                    }
                    MemberRef::Symbolic { .. } => false,
                },
                _ => false,
            })
            .expect("cache field read");
        assert!(matches!(
            &insns[position + 1].1,
            Insn::Simple(node) if node.opcode == opcodes::ICONST_0
        ));

        let records = ctx.cache().locations("com/acme/Foo");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].class_name, "com.acme.Foo");
        assert_eq!(records[0].method_name, "run");
        assert_eq!(records[0].file_name, "Foo.java");
        assert_eq!(records[0].line, 42);

        let caches = ctx.finish().unwrap();
        assert_eq!(caches["com/acme/Foo"].locations, 1);
    }

    #[test]
    fn test_concurrent_conversions_agree_on_indices() {
        let ctx = context();
        let input = class_bytes(
            "com/acme/Foo",
            Some("Foo.java"),
            vec![info_method("a", 10), info_method("b", 20)],
        );
        let outputs: Vec<Vec<u8>> = (0..16)
            .into_par_iter()
            .map(|_| convert(&input, &ctx).unwrap().bytes)
            .collect();
        assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));

        let records = ctx.cache().locations("com/acme/Foo");
        assert_eq!(records.len(), 2);
        assert_eq!((records[0].method_name.as_str(), records[0].line), ("a", 10));
        assert_eq!((records[1].method_name.as_str(), records[1].line), ("b", 20));
        assert_eq!(ctx.finish().unwrap()["com/acme/Foo"].locations, 2);
    }

    #[test]
    fn test_shared_shape_is_emitted_once() {
        let ctx = context();
        let input = class_bytes(
            "com/acme/Foo",
            Some("Foo.java"),
            vec![exit_method("a", 10), exit_method("b", 20)],
        );
        let converted = convert(&input, &ctx).unwrap();
        assert_eq!(converted.call_sites, 2);
        let parsed = read_class_file(&converted.bytes).unwrap();
        assert_eq!(parsed.bootstrap_methods().len(), 1);
        for method in &parsed.methods {
            assert!(method.code().unwrap().attributes.iter().any(|attr| attr.name() == "LineNumberTable"));
        }

        let caches = ctx.finish().unwrap();
        let cache = read_class_file(&caches["com/acme/Foo"].bytes).unwrap();
        assert_eq!(method_names(&cache), vec!["<clinit>", "exitResult"]);
    }

    #[test]
    fn test_nested_classes_share_their_outer_group() {
        let ctx = context();
        let outer = class_bytes("com/acme/Foo", Some("Foo.java"), vec![info_method("a", 1)]);
        let inner = class_bytes("com/acme/Foo$Inner", Some("Foo.java"), vec![info_method("b", 2)]);
        convert(&outer, &ctx).unwrap();
        assert_eq!(
            convert(&inner, &ctx).unwrap().group.as_deref(),
            Some("com/acme/Foo")
        );
        let records = ctx.cache().locations("com/acme/Foo");
        assert_eq!(records[1].class_name, "com.acme.Foo$Inner");
        assert_eq!(ctx.finish().unwrap().len(), 1);
    }

    #[test]
    fn test_untouched_classes_pass_through() {
        let ctx = context();
        let mut plain = MethodBuilder::new(constants::ACC_STATIC, "run", "()V");
        plain.code(insn_list! { [RETURN] });
        let mut supplier = MethodBuilder::new(
            constants::ACC_STATIC,
            "lazy",
            "(Lorg/apache/logging/log4j/Logger;Lorg/apache/logging/log4j/util/Supplier;)V",
        );
        supplier.code(insn_list! {
            [var ALOAD 0]
            [var ALOAD 1]
            [iface api::LOGGER, "info", "(Lorg/apache/logging/log4j/util/Supplier;)V"]
            [RETURN]
        });
        let input = class_bytes("com/acme/Plain", None, vec![plain, supplier]);
        let converted = convert(&input, &ctx).unwrap();
        assert!(!converted.is_rewritten());
        assert_eq!(converted.bytes, input);
        assert!(ctx.cache().group_keys().is_empty());
    }

    #[test]
    fn test_missing_source_file_is_fatal() {
        let ctx = context();
        let input = class_bytes("com/acme/Foo", None, vec![info_method("run", 42)]);
        let err = convert(&input, &ctx).unwrap_err();
        assert!(matches!(
            &err,
            ConvertError::MissingDebugInfo { class, method, .. }
                if class == "com/acme/Foo" && method == "run"
        ));
    }

    #[test]
    fn test_old_class_version_cannot_take_suppliers() {
        let ctx = context();
        let mut builder = ClassBuilder::new("com/acme/Old", constants::JAVA_LANG_OBJECT);
        builder.version(constants::V1_6, 0).source_file("Old.java").add_method(exit_method("a", 3));
        let input = write_class_file(&builder.build(&BootstrapClasses).unwrap()).unwrap();
        let err = convert(&input, &ctx).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedVersion { major: 50, .. }));
    }

    /// Knows two application classes on top of the JDK table.
    struct Known;

    impl ClassHierarchy for Known {
        fn resolve(&self, name: &str) -> Result<ClassInfo, HierarchyError> {
            match name {
                "com/acme/Left" | "com/acme/Right" => Ok(ClassInfo {
                    name: name.to_string(),
                    super_name: Some(constants::JAVA_LANG_OBJECT.to_string()),
                    interfaces: Vec::new(),
                    is_interface: false,
                }),
                _ => BootstrapClasses.resolve(name),
            }
        }
    }

    #[test]
    fn test_unresolvable_join_names_missing_class() {
        let mut method = MethodBuilder::new(
            constants::ACC_STATIC,
            "pick",
            "(ZLcom/acme/Left;Lcom/acme/Right;Lorg/apache/logging/log4j/Logger;)Ljava/lang/Object;",
        );
        method.code(insn_list! {
            [label 0]
            [line 5, 0]
            [var ALOAD 3]
            [ldc "x"]
            [iface api::LOGGER, "info", "(Ljava/lang/String;)V"]
            [var ILOAD 0]
            [jump IFEQ 1]
            [var ALOAD 1]
            [jump GOTO 2]
            [label 1]
            [var ALOAD 2]
            [label 2]
            [ARETURN]
        });
        let mut builder = ClassBuilder::new("com/acme/Picker", constants::JAVA_LANG_OBJECT);
        builder.source_file("Picker.java").add_method(method);
        let input = write_class_file(&builder.build(&Known).unwrap()).unwrap();

        let err = convert(&input, &context()).unwrap_err();
        match err {
            ConvertError::Resolution { class, missing, .. } => {
                assert_eq!(class, "com/acme/Picker");
                assert!(missing == "com/acme/Left" || missing == "com/acme/Right");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let converted =
            convert(&input, &BatchContext::new(Registry::log4j_api(), Known)).unwrap();
        let parsed = read_class_file(&converted.bytes).unwrap();
        assert!(parsed.methods[0]
            .code()
            .unwrap()
            .attributes
            .iter()
            .any(|attr| attr.name() == "StackMapTable"));
    }

    #[test]
    fn test_malformed_input_reports_what_it_can() {
        let ctx = context();
        let err = convert(b"not a class", &ctx).unwrap_err();
        assert!(matches!(err, ConvertError::Malformed { class: None, .. }));

        let input = class_bytes("com/acme/Foo", Some("Foo.java"), vec![info_method("run", 1)]);
        let err = convert(&input[..input.len() - 3], &ctx).unwrap_err();
        assert_eq!(err.class_name(), Some("com/acme/Foo"));
    }

    #[test]
    fn test_constant_pool_only_grows() {
        let ctx = context();
        let input = class_bytes("com/acme/Foo", Some("Foo.java"), vec![info_method("run", 7)]);
        let before = read_class_file(&input).unwrap();
        let after = read_class_file(&convert(&input, &ctx).unwrap().bytes).unwrap();
        assert!(after.constant_pool.len() > before.constant_pool.len());
        for (index, entry) in before.constant_pool.iter().enumerate() {
            if let CpInfo::Utf8(value) = entry {
                assert!(matches!(&after.constant_pool[index], CpInfo::Utf8(other) if other == value));
            }
        }
    }
}
