//! Location cache builder.
//!
//! Records are grouped by top-level class. Each group has its own lock, so
//! classes from different source files never contend, and the lookup and
//! append of a record happen in one critical section.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::api;
use crate::builder::{ClassBuilder, FieldBuilder, MethodBuilder};
use crate::class_writer::write_class_file;
use crate::constants;
use crate::error::ConvertError;
use crate::hierarchy::ClassHierarchy;
use crate::insn::{InsnList, InsnNode, NodeList};
use crate::naming;
use crate::opcodes;
use crate::shape::LambdaShape;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationRecord {
    /// Binary name of the declaring class, `com.acme.Foo$Bar`.
    pub class_name: String,
    pub method_name: String,
    pub file_name: String,
    pub line: u16,
}

/// A static method of a cache class, usable as an `invokestatic` target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeRef {
    pub owner: String,
    pub name: &'static str,
    pub descriptor: String,
}

#[derive(Debug, Default)]
pub struct CacheGroup {
    locations: Vec<LocationRecord>,
    index: HashMap<LocationRecord, usize>,
    shapes: Vec<LambdaShape>,
}

impl CacheGroup {
    pub fn locations(&self) -> &[LocationRecord] {
        &self.locations
    }

    /// Requested shapes, in first-requested order.
    pub fn shapes(&self) -> &[LambdaShape] {
        &self.shapes
    }

    fn add_location(&mut self, record: LocationRecord) -> usize {
        if let Some(&index) = self.index.get(&record) {
            return index;
        }
        let index = self.locations.len();
        self.index.insert(record.clone(), index);
        self.locations.push(record);
        index
    }

    fn request_shape(&mut self, shape: LambdaShape) {
        if !self.shapes.contains(&shape) {
            self.shapes.push(shape);
        }
    }
}

/// An emitted cache class.
#[derive(Debug, Clone)]
pub struct CacheClass {
    /// Internal name, `com/acme/Foo$$Log4j2$$Cache`.
    pub name: String,
    pub bytes: Vec<u8>,
    pub locations: usize,
    pub shapes: usize,
}

#[derive(Debug, Default)]
pub struct LocationCache {
    groups: DashMap<String, Arc<Mutex<CacheGroup>>>,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn group(&self, class_name: &str) -> Arc<Mutex<CacheGroup>> {
        let key = naming::top_level_name(class_name);
        if let Some(group) = self.groups.get(key) {
            return Arc::clone(group.value());
        }
        Arc::clone(self.groups.entry(key.to_string()).or_default().value())
    }

    /// Index of `record` in the group of `class_name`, appending it if this
    /// is the first time it is seen.
    pub fn add_location(&self, class_name: &str, record: LocationRecord) -> usize {
        let group = self.group(class_name);
        let index = group.lock().add_location(record);
        trace!(group = naming::top_level_name(class_name), index, "location");
        index
    }

    /// Registers `shape` for the group of `class_name` and returns the static
    /// method implementing it.
    pub fn request_shape(&self, class_name: &str, shape: LambdaShape) -> ShapeRef {
        self.group(class_name).lock().request_shape(shape);
        ShapeRef {
            owner: naming::cache_class_name(class_name),
            name: shape.method_name(),
            descriptor: shape.descriptor(),
        }
    }

    /// Group keys known so far.
    pub fn group_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.groups.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    /// A copy of one group's records, for inspection.
    pub fn locations(&self, group_key: &str) -> Vec<LocationRecord> {
        self.groups
            .get(group_key)
            .map(|group| group.lock().locations().to_vec())
            .unwrap_or_default()
    }

    /// Generates one class per group, keyed by group. Only call this once no
    /// conversion can add to a group any more.
    pub(crate) fn emit(
        self,
        hierarchy: &dyn ClassHierarchy,
    ) -> Result<BTreeMap<String, CacheClass>, ConvertError> {
        let mut classes = BTreeMap::new();
        for (key, group) in self.groups {
            let group = group.lock();
            let class = emit_group(&key, &group, hierarchy)?;
            debug!(
                class = %class.name,
                locations = class.locations,
                shapes = class.shapes,
                "emitted cache class"
            );
            classes.insert(key, class);
        }
        Ok(classes)
    }
}

fn emit_group(
    key: &str,
    group: &CacheGroup,
    hierarchy: &dyn ClassHierarchy,
) -> Result<CacheClass, ConvertError> {
    let name = naming::cache_class_name(key);
    let mut class = ClassBuilder::new(&name, constants::JAVA_LANG_OBJECT);
    class.access_flags(constants::ACC_FINAL | constants::ACC_SUPER | constants::ACC_SYNTHETIC);
    class.add_field(FieldBuilder::new(
        constants::ACC_STATIC | constants::ACC_FINAL,
        api::LOCATIONS_FIELD,
        api::LOCATIONS_DESC,
    ));

    let mut clinit = MethodBuilder::new(constants::ACC_STATIC, "<clinit>", "()V");
    clinit.code(locations_initializer(&name, group.locations()));
    class.add_method(clinit);

    for shape in group.shapes() {
        let mut method = MethodBuilder::new(
            constants::ACC_STATIC | constants::ACC_SYNTHETIC,
            shape.method_name(),
            &shape.descriptor(),
        );
        method.code(shape.body());
        class.add_method(method);
    }

    let class_file = class
        .build(hierarchy)
        .map_err(|source| ConvertError::write(&name, source))?;
    let bytes = write_class_file(&class_file).map_err(|source| ConvertError::write(&name, source))?;
    Ok(CacheClass {
        name,
        bytes,
        locations: group.locations().len(),
        shapes: group.shapes().len(),
    })
}

/// `locations = new StackTraceElement[] { ... }`
fn locations_initializer(owner: &str, locations: &[LocationRecord]) -> NodeList {
    let mut code = InsnList::new();
    code.push_int(locations.len() as i32);
    let mut list = NodeList::from(code);
    list.append(insn_list! { [type ANEWARRAY api::STACK_TRACE_ELEMENT] });
    for (index, record) in locations.iter().enumerate() {
        let mut element = InsnList::new();
        element.add(InsnNode {
            opcode: opcodes::DUP,
        });
        element.push_int(index as i32);
        list.extend(element);
        list.append(insn_list! {
            [type NEW api::STACK_TRACE_ELEMENT]
            [DUP]
            [ldc &record.class_name]
            [ldc &record.method_name]
            [ldc &record.file_name]
        });
        let mut line = InsnList::new();
        line.push_int(i32::from(record.line));
        list.extend(line);
        list.append(insn_list! {
            [method INVOKESPECIAL api::STACK_TRACE_ELEMENT, "<init>", api::STACK_TRACE_ELEMENT_INIT_DESC]
            [AASTORE]
        });
    }
    list.append(insn_list! {
        [field PUTSTATIC owner, api::LOCATIONS_FIELD, api::LOCATIONS_DESC]
        [RETURN]
    });
    list
}

#[cfg(test)]
mod tests {
    use rayon::prelude::*;

    use super::*;
    use crate::class_reader::{AttributeInfo, CpInfo, read_class_file};
    use crate::hierarchy::BootstrapClasses;

    fn record(method: &str, line: u16) -> LocationRecord {
        LocationRecord {
            class_name: "com.acme.Foo".to_string(),
            method_name: method.to_string(),
            file_name: "Foo.java".to_string(),
            line,
        }
    }

    #[test]
    fn test_identical_records_share_an_index() {
        let cache = LocationCache::new();
        assert_eq!(cache.add_location("com/acme/Foo", record("a", 10)), 0);
        assert_eq!(cache.add_location("com/acme/Foo", record("b", 20)), 1);
        assert_eq!(cache.add_location("com/acme/Foo", record("a", 10)), 0);
        assert_eq!(cache.locations("com/acme/Foo").len(), 2);
    }

    #[test]
    fn test_concurrent_dedup_assigns_one_index_per_record() {
        let cache = LocationCache::new();
        let indices: Vec<usize> = (0..2_000)
            .into_par_iter()
            .map(|i| cache.add_location("com/acme/Foo$Worker", record("run", (i % 50) as u16)))
            .collect();
        let locations = cache.locations("com/acme/Foo");
        assert_eq!(locations.len(), 50);
        for (i, index) in indices.into_iter().enumerate() {
            assert_eq!(locations[index].line, (i % 50) as u16);
        }
    }

    #[test]
    fn test_groups_are_isolated_and_nested_classes_share() {
        let cache = LocationCache::new();
        cache.add_location("com/acme/Foo", record("a", 1));
        cache.add_location("com/acme/Foo$1", record("b", 2));
        cache.add_location("com/acme/Foo$Inner$2", record("c", 3));
        cache.add_location("com/acme/Bar", record("a", 1));
        assert_eq!(cache.group_keys(), vec!["com/acme/Bar", "com/acme/Foo"]);
        assert_eq!(cache.locations("com/acme/Foo").len(), 3);
        assert_eq!(cache.locations("com/acme/Bar").len(), 1);
    }

    #[test]
    fn test_request_shape_is_idempotent() {
        let cache = LocationCache::new();
        let first = cache.request_shape("com/acme/Foo$1", LambdaShape::ExitResult);
        let second = cache.request_shape("com/acme/Foo", LambdaShape::ExitResult);
        assert_eq!(first, second);
        assert_eq!(first.owner, "com/acme/Foo$$Log4j2$$Cache");
        assert_eq!(first.name, "exitResult");
        cache.request_shape("com/acme/Foo", LambdaShape::Entry);
        let classes = cache.emit(&BootstrapClasses).unwrap();
        assert_eq!(classes["com/acme/Foo"].shapes, 2);
    }

    #[test]
    fn test_emitted_class_layout() {
        let cache = LocationCache::new();
        cache.add_location("com/acme/Foo", record("a", 10));
        cache.add_location("com/acme/Foo", record("b", 300));
        cache.request_shape("com/acme/Foo", LambdaShape::Formatted);
        let classes = cache.emit(&BootstrapClasses).unwrap();
        let class = &classes["com/acme/Foo"];
        assert_eq!(class.name, "com/acme/Foo$$Log4j2$$Cache");
        assert_eq!(class.locations, 2);

        let parsed = read_class_file(&class.bytes).unwrap();
        assert_eq!(parsed.major_version, constants::V1_8);
        assert_eq!(
            parsed.access_flags,
            constants::ACC_FINAL | constants::ACC_SUPER | constants::ACC_SYNTHETIC
        );
        assert_eq!(parsed.fields.len(), 1);
        let method_names: Vec<_> = parsed
            .methods
            .iter()
            .map(|method| parsed.cp_utf8(method.name_index).unwrap().to_string())
            .collect();
        assert_eq!(method_names, vec!["<clinit>", "formatted"]);
        let strings: Vec<_> = parsed
            .constant_pool
            .iter()
            .filter_map(|entry| match entry {
                CpInfo::Utf8(value) => Some(value.as_str()),
                _ => None,
            })
            .collect();
        assert!(strings.contains(&"com.acme.Foo"));
        assert!(strings.contains(&"Foo.java"));
        let clinit = parsed.methods[0].code().unwrap();
        // array, dup, index, new, dup, three strings and the line
        assert_eq!(clinit.max_stack, 9);
        assert!(
            !clinit
                .attributes
                .iter()
                .any(|attr| matches!(attr, AttributeInfo::StackMapTable { .. }))
        );
    }
}
