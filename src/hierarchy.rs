//! Ancestor resolution for frame computation.
//!
//! Merging two reference types at a control-flow join needs their common
//! superclass, which in turn needs the class headers of both ancestries.
//! [`ClassPath`] finds them in directories, jars and JDK `.jmod` files,
//! falling back to a small table of `java.lang` types for when no JDK is on
//! the classpath.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};
use zip::ZipArchive;

use crate::class_reader::read_class_file;
use crate::constants::{self, JAVA_LANG_OBJECT};
use crate::error::HierarchyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub is_interface: bool,
}

impl ClassInfo {
    pub fn from_class_bytes(name: &str, bytes: &[u8]) -> Result<Self, HierarchyError> {
        let malformed = |source| HierarchyError::Malformed {
            name: name.to_string(),
            source,
        };
        let class_file = read_class_file(bytes).map_err(malformed)?;
        let node = class_file.to_class_node().map_err(malformed)?;
        Ok(Self {
            name: node.name,
            super_name: node.super_name,
            interfaces: node.interfaces,
            is_interface: node.access_flags & constants::ACC_INTERFACE != 0,
        })
    }
}

/// Looks up class headers by internal name.
pub trait ClassHierarchy: Send + Sync {
    fn resolve(&self, name: &str) -> Result<ClassInfo, HierarchyError>;
}

/// The most specific class both `left` and `right` are assignable to.
/// Interfaces merge to `java/lang/Object`, as the verifier treats them.
pub fn common_superclass(
    hierarchy: &dyn ClassHierarchy,
    left: &str,
    right: &str,
) -> Result<String, HierarchyError> {
    if left == right {
        return Ok(left.to_string());
    }
    if left == JAVA_LANG_OBJECT || right == JAVA_LANG_OBJECT {
        return Ok(JAVA_LANG_OBJECT.to_string());
    }
    if left.starts_with('[') || right.starts_with('[') {
        return common_array_type(hierarchy, left, right);
    }

    let left_info = hierarchy.resolve(left)?;
    let right_info = hierarchy.resolve(right)?;
    if left_info.is_interface || right_info.is_interface {
        return Ok(JAVA_LANG_OBJECT.to_string());
    }

    let mut ancestors = HashSet::new();
    let mut current = Some(left_info);
    while let Some(info) = current {
        ancestors.insert(info.name.clone());
        current = match info.super_name {
            Some(parent) if !ancestors.contains(&parent) => Some(hierarchy.resolve(&parent)?),
            _ => None,
        };
    }

    let mut current = Some(right_info);
    while let Some(info) = current {
        if ancestors.contains(&info.name) {
            return Ok(info.name);
        }
        current = match info.super_name {
            Some(parent) => Some(hierarchy.resolve(&parent)?),
            None => None,
        };
    }
    Ok(JAVA_LANG_OBJECT.to_string())
}

fn common_array_type(
    hierarchy: &dyn ClassHierarchy,
    left: &str,
    right: &str,
) -> Result<String, HierarchyError> {
    let (Some(left_elem), Some(right_elem)) = (left.strip_prefix('['), right.strip_prefix('['))
    else {
        return Ok(JAVA_LANG_OBJECT.to_string());
    };
    let reference_name = |elem: &str| -> Option<String> {
        if elem.starts_with('[') {
            Some(elem.to_string())
        } else {
            elem.strip_prefix('L')
                .and_then(|rest| rest.strip_suffix(';'))
                .map(str::to_string)
        }
    };
    match (reference_name(left_elem), reference_name(right_elem)) {
        (Some(l), Some(r)) => {
            let common = common_superclass(hierarchy, &l, &r)?;
            if common.starts_with('[') {
                Ok(format!("[{common}"))
            } else {
                Ok(format!("[L{common};"))
            }
        }
        _ => Ok(JAVA_LANG_OBJECT.to_string()),
    }
}

/// Built-in headers for core JDK types.
#[derive(Debug, Default, Clone, Copy)]
pub struct BootstrapClasses;

const BOOTSTRAP_CLASSES: &[(&str, Option<&str>, bool)] = &[
    ("java/lang/Object", None, false),
    ("java/lang/String", Some("java/lang/Object"), false),
    ("java/lang/Class", Some("java/lang/Object"), false),
    ("java/lang/Number", Some("java/lang/Object"), false),
    ("java/lang/Integer", Some("java/lang/Number"), false),
    ("java/lang/Long", Some("java/lang/Number"), false),
    ("java/lang/Boolean", Some("java/lang/Object"), false),
    ("java/lang/Enum", Some("java/lang/Object"), false),
    ("java/lang/StackTraceElement", Some("java/lang/Object"), false),
    ("java/lang/StringBuilder", Some("java/lang/Object"), false),
    ("java/lang/Throwable", Some("java/lang/Object"), false),
    ("java/lang/Exception", Some("java/lang/Throwable"), false),
    ("java/lang/Error", Some("java/lang/Throwable"), false),
    ("java/lang/RuntimeException", Some("java/lang/Exception"), false),
    ("java/lang/IllegalArgumentException", Some("java/lang/RuntimeException"), false),
    ("java/lang/IllegalStateException", Some("java/lang/RuntimeException"), false),
    ("java/lang/NullPointerException", Some("java/lang/RuntimeException"), false),
    ("java/lang/UnsupportedOperationException", Some("java/lang/RuntimeException"), false),
    ("java/lang/ReflectiveOperationException", Some("java/lang/Exception"), false),
    ("java/lang/InterruptedException", Some("java/lang/Exception"), false),
    ("java/io/IOException", Some("java/lang/Exception"), false),
    ("java/io/UncheckedIOException", Some("java/lang/RuntimeException"), false),
    ("java/lang/CharSequence", Some("java/lang/Object"), true),
    ("java/lang/Comparable", Some("java/lang/Object"), true),
    ("java/lang/Runnable", Some("java/lang/Object"), true),
    ("java/lang/Iterable", Some("java/lang/Object"), true),
    ("java/lang/AutoCloseable", Some("java/lang/Object"), true),
    ("java/io/Serializable", Some("java/lang/Object"), true),
];

impl ClassHierarchy for BootstrapClasses {
    fn resolve(&self, name: &str) -> Result<ClassInfo, HierarchyError> {
        BOOTSTRAP_CLASSES
            .iter()
            .find(|(candidate, _, _)| *candidate == name)
            .map(|(name, super_name, is_interface)| ClassInfo {
                name: name.to_string(),
                super_name: super_name.map(str::to_string),
                interfaces: Vec::new(),
                is_interface: *is_interface,
            })
            .ok_or_else(|| HierarchyError::Missing {
                name: name.to_string(),
            })
    }
}

/// `.jmod` files are zip archives behind this header, with classes under
/// `classes/`.
const JMOD_MAGIC: [u8; 4] = *b"JM\x01\x00";

enum Root {
    Dir(PathBuf),
    Jar {
        path: PathBuf,
        prefix: &'static str,
        archive: Mutex<ZipArchive<Trimmed>>,
    },
}

/// A file read as if it began `start` bytes in.
struct Trimmed {
    file: File,
    start: u64,
}

impl Trimmed {
    fn new(mut file: File, start: u64) -> io::Result<Self> {
        file.seek(SeekFrom::Start(start))?;
        Ok(Self { file, start })
    }
}

impl Read for Trimmed {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for Trimmed {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let pos = match pos {
            SeekFrom::Start(offset) => SeekFrom::Start(offset + self.start),
            relative => relative,
        };
        let absolute = self.file.seek(pos)?;
        absolute
            .checked_sub(self.start)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before archive start"))
    }
}

/// Resolves classes from directories and archives, in the order given.
pub struct ClassPath {
    roots: Vec<Root>,
    cache: DashMap<String, ClassInfo>,
}

impl ClassPath {
    pub fn new() -> Self {
        Self {
            roots: Vec::new(),
            cache: DashMap::new(),
        }
    }

    /// Adds a directory, a `.jar`/`.zip` archive or a `.jmod` file.
    pub fn add_root(&mut self, path: &Path) -> io::Result<()> {
        if path.is_dir() {
            debug!(path = %path.display(), "classpath directory");
            self.roots.push(Root::Dir(path.to_path_buf()));
            return Ok(());
        }
        let mut file = File::open(path)?;
        let mut magic = Vec::with_capacity(JMOD_MAGIC.len());
        (&mut file).take(JMOD_MAGIC.len() as u64).read_to_end(&mut magic)?;
        let (start, prefix) = if magic == JMOD_MAGIC {
            (JMOD_MAGIC.len() as u64, "classes/")
        } else {
            (0, "")
        };
        let archive = ZipArchive::new(Trimmed::new(file, start)?)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        debug!(path = %path.display(), entries = archive.len(), prefix, "classpath archive");
        self.roots.push(Root::Jar {
            path: path.to_path_buf(),
            prefix,
            archive: Mutex::new(archive),
        });
        Ok(())
    }

    /// Adds the platform classes of the JDK at `java_home`: every
    /// `jmods/*.jmod`, or `rt.jar` for a JDK 8 layout. Returns the number of
    /// archives added.
    pub fn add_jdk(&mut self, java_home: &Path) -> io::Result<usize> {
        let pattern = format!(
            "{}/jmods/*.jmod",
            glob::Pattern::escape(&java_home.to_string_lossy())
        );
        let mut archives = glob::glob(&pattern)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(glob::GlobError::into_error)?;
        archives.sort();
        if archives.is_empty() {
            archives.extend(
                ["jre/lib/rt.jar", "lib/rt.jar"]
                    .iter()
                    .map(|legacy| java_home.join(legacy))
                    .find(|path| path.is_file()),
            );
        }
        for archive in &archives {
            self.add_root(archive)?;
        }
        debug!(java_home = %java_home.display(), archives = archives.len(), "jdk classes");
        Ok(archives.len())
    }

    pub fn with_roots<P: AsRef<Path>>(paths: &[P]) -> io::Result<Self> {
        let mut class_path = Self::new();
        for path in paths {
            class_path.add_root(path.as_ref())?;
        }
        Ok(class_path)
    }

    fn find_bytes(&self, name: &str) -> Result<Option<Vec<u8>>, HierarchyError> {
        let entry = format!("{name}.class");
        for root in &self.roots {
            match root {
                Root::Dir(dir) => {
                    let path = dir.join(&entry);
                    match std::fs::read(&path) {
                        Ok(bytes) => return Ok(Some(bytes)),
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                        Err(source) => {
                            return Err(HierarchyError::Io {
                                name: name.to_string(),
                                path,
                                source,
                            });
                        }
                    }
                }
                Root::Jar {
                    path,
                    prefix,
                    archive,
                } => {
                    let mut archive = archive.lock();
                    let mut file = match archive.by_name(&format!("{prefix}{entry}")) {
                        Ok(file) => file,
                        Err(zip::result::ZipError::FileNotFound) => continue,
                        Err(err) => {
                            return Err(HierarchyError::Io {
                                name: name.to_string(),
                                path: path.clone(),
                                source: io::Error::new(io::ErrorKind::InvalidData, err),
                            });
                        }
                    };
                    let mut bytes = Vec::with_capacity(file.size() as usize);
                    file.read_to_end(&mut bytes)
                        .map_err(|source| HierarchyError::Io {
                            name: name.to_string(),
                            path: path.clone(),
                            source,
                        })?;
                    return Ok(Some(bytes));
                }
            }
        }
        Ok(None)
    }
}

impl Default for ClassPath {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassHierarchy for ClassPath {
    fn resolve(&self, name: &str) -> Result<ClassInfo, HierarchyError> {
        if let Some(info) = self.cache.get(name) {
            return Ok(info.clone());
        }
        let info = match self.find_bytes(name)? {
            Some(bytes) => ClassInfo::from_class_bytes(name, &bytes)?,
            None => BootstrapClasses.resolve(name)?,
        };
        trace!(class = name, super_name = ?info.super_name, "resolved");
        self.cache.insert(name.to_string(), info.clone());
        Ok(info)
    }
}

/// Serves one class from memory and defers everything else.
pub struct Overlay<'a> {
    class: ClassInfo,
    parent: &'a dyn ClassHierarchy,
}

impl<'a> Overlay<'a> {
    pub fn new(class: ClassInfo, parent: &'a dyn ClassHierarchy) -> Self {
        Self { class, parent }
    }
}

impl ClassHierarchy for Overlay<'_> {
    fn resolve(&self, name: &str) -> Result<ClassInfo, HierarchyError> {
        if name == self.class.name {
            Ok(self.class.clone())
        } else {
            self.parent.resolve(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::builder::ClassBuilder;
    use crate::class_writer::write_class_file;

    fn class_bytes(name: &str, super_name: &str, access_flags: u16) -> Vec<u8> {
        let mut builder = ClassBuilder::new(name, super_name);
        builder.access_flags(access_flags);
        let class_file = builder.build(&BootstrapClasses).unwrap();
        write_class_file(&class_file).unwrap()
    }

    #[test]
    fn test_common_superclass_over_bootstrap_table() {
        let hierarchy = BootstrapClasses;
        assert_eq!(
            common_superclass(
                &hierarchy,
                "java/lang/IllegalArgumentException",
                "java/lang/IllegalStateException"
            )
            .unwrap(),
            "java/lang/RuntimeException"
        );
        assert_eq!(
            common_superclass(&hierarchy, "java/io/IOException", "java/lang/Error").unwrap(),
            "java/lang/Throwable"
        );
        assert_eq!(
            common_superclass(&hierarchy, "java/lang/String", "java/lang/CharSequence").unwrap(),
            "java/lang/Object"
        );
        assert_eq!(
            common_superclass(&hierarchy, "[Ljava/lang/Integer;", "[Ljava/lang/Long;").unwrap(),
            "[Ljava/lang/Number;"
        );
        assert_eq!(
            common_superclass(&hierarchy, "[I", "[Ljava/lang/Long;").unwrap(),
            "java/lang/Object"
        );
    }

    #[test]
    fn test_missing_ancestor_is_named() {
        let err = common_superclass(&BootstrapClasses, "com/acme/Left", "java/lang/String")
            .unwrap_err();
        assert_eq!(err.class_name(), "com/acme/Left");
    }

    #[test]
    fn test_directory_root_resolves_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("com/acme");
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(
            package.join("Base.class"),
            class_bytes("com/acme/Base", "java/lang/RuntimeException", constants::ACC_PUBLIC),
        )
        .unwrap();
        std::fs::write(
            package.join("Child.class"),
            class_bytes("com/acme/Child", "com/acme/Base", constants::ACC_PUBLIC),
        )
        .unwrap();

        let class_path = ClassPath::with_roots(&[dir.path()]).unwrap();
        assert_eq!(
            common_superclass(&class_path, "com/acme/Child", "java/lang/IllegalStateException")
                .unwrap(),
            "java/lang/RuntimeException"
        );
        std::fs::remove_file(package.join("Child.class")).unwrap();
        let cached = class_path.resolve("com/acme/Child").unwrap();
        assert_eq!(cached.super_name.as_deref(), Some("com/acme/Base"));
    }

    #[test]
    fn test_class_info_reads_interfaces() {
        let mut builder = ClassBuilder::new("com/acme/Task", JAVA_LANG_OBJECT);
        builder.add_interface("java/lang/Runnable");
        let bytes = write_class_file(&builder.build(&BootstrapClasses).unwrap()).unwrap();
        let info = ClassInfo::from_class_bytes("com/acme/Task", &bytes).unwrap();
        assert_eq!(info.interfaces, vec!["java/lang/Runnable"]);
        assert!(!info.is_interface);
    }

    #[test]
    fn test_jar_root_resolves_interfaces() {
        let dir = tempfile::tempdir().unwrap();
        let jar_path = dir.path().join("api.jar");
        let file = File::create(&jar_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("com/acme/Api.class", zip::write::FileOptions::default())
            .unwrap();
        writer
            .write_all(&class_bytes(
                "com/acme/Api",
                "java/lang/Object",
                constants::ACC_PUBLIC | constants::ACC_INTERFACE | constants::ACC_ABSTRACT,
            ))
            .unwrap();
        writer.finish().unwrap();

        let class_path = ClassPath::with_roots(&[&jar_path]).unwrap();
        let info = class_path.resolve("com/acme/Api").unwrap();
        assert!(info.is_interface);
        assert!(matches!(
            class_path.resolve("com/acme/Nope"),
            Err(HierarchyError::Missing { .. })
        ));
    }

    fn write_jmod(path: &Path, entries: &[(&str, Vec<u8>)]) {
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(bytes).unwrap();
        }
        let zip = writer.finish().unwrap().into_inner();
        let mut file = File::create(path).unwrap();
        file.write_all(&JMOD_MAGIC).unwrap();
        file.write_all(&zip).unwrap();
    }

    #[test]
    fn test_jmod_root_resolves_platform_classes() {
        let dir = tempfile::tempdir().unwrap();
        let jmod = dir.path().join("java.base.jmod");
        write_jmod(
            &jmod,
            &[(
                "classes/java/net/URISyntaxException.class",
                class_bytes("java/net/URISyntaxException", "java/lang/Exception", constants::ACC_PUBLIC),
            )],
        );

        let class_path = ClassPath::with_roots(&[&jmod]).unwrap();
        let info = class_path.resolve("java/net/URISyntaxException").unwrap();
        assert_eq!(info.super_name.as_deref(), Some("java/lang/Exception"));
        assert_eq!(
            common_superclass(&class_path, "java/net/URISyntaxException", "java/io/IOException")
                .unwrap(),
            "java/lang/Exception"
        );
        assert!(matches!(
            BootstrapClasses.resolve("java/net/URISyntaxException"),
            Err(HierarchyError::Missing { .. })
        ));
    }

    #[test]
    fn test_add_jdk_finds_jmods() {
        let home = tempfile::tempdir().unwrap();
        let jmods = home.path().join("jmods");
        std::fs::create_dir_all(&jmods).unwrap();
        write_jmod(
            &jmods.join("java.sql.jmod"),
            &[(
                "classes/java/sql/SQLException.class",
                class_bytes("java/sql/SQLException", "java/lang/Exception", constants::ACC_PUBLIC),
            )],
        );
        write_jmod(
            &jmods.join("java.base.jmod"),
            &[(
                "classes/java/net/URISyntaxException.class",
                class_bytes("java/net/URISyntaxException", "java/lang/Exception", constants::ACC_PUBLIC),
            )],
        );

        let mut class_path = ClassPath::new();
        assert_eq!(class_path.add_jdk(home.path()).unwrap(), 2);
        assert_eq!(
            common_superclass(&class_path, "java/sql/SQLException", "java/net/URISyntaxException")
                .unwrap(),
            "java/lang/Exception"
        );

        let empty = tempfile::tempdir().unwrap();
        assert_eq!(ClassPath::new().add_jdk(empty.path()).unwrap(), 0);
    }

    #[test]
    fn test_overlay_serves_class_under_conversion() {
        let overlay = Overlay::new(
            ClassInfo {
                name: "com/acme/Service".to_string(),
                super_name: Some("java/lang/Exception".to_string()),
                interfaces: Vec::new(),
                is_interface: false,
            },
            &BootstrapClasses,
        );
        assert_eq!(
            common_superclass(&overlay, "com/acme/Service", "java/io/IOException").unwrap(),
            "java/lang/Exception"
        );
    }
}
