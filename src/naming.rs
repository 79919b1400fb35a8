//! Cache class naming.
//!
//! Every class compiled from one source file shares the cache class of its
//! top-level class: `com/acme/Foo$Inner$1` uses `com/acme/Foo$$Log4j2$$Cache`.

use std::path::{Path, PathBuf};

pub const CACHE_SUFFIX: &str = "$$Log4j2$$Cache";

/// Internal name of the top-level class enclosing `class_name`. Only the
/// simple name is cut, and a leading `$` does not count as a separator.
pub fn top_level_name(class_name: &str) -> &str {
    let simple_start = class_name.rfind('/').map_or(0, |slash| slash + 1);
    let simple = &class_name[simple_start..];
    match simple.char_indices().skip(1).find(|(_, ch)| *ch == '$') {
        Some((dollar, _)) => &class_name[..simple_start + dollar],
        None => class_name,
    }
}

/// Internal name of the cache class for the group `class_name` belongs to.
pub fn cache_class_name(class_name: &str) -> String {
    format!("{}{CACHE_SUFFIX}", top_level_name(class_name))
}

pub fn is_cache_class(class_name: &str) -> bool {
    class_name.ends_with(CACHE_SUFFIX)
}

/// `com/acme/Foo$Bar` -> `com.acme.Foo$Bar`, as `StackTraceElement` reports it.
pub fn binary_name(class_name: &str) -> String {
    class_name.replace('/', ".")
}

/// Relative path of the class file for an internal name.
pub fn class_file_path(class_name: &str) -> PathBuf {
    let mut path: PathBuf = class_name.split('/').collect();
    path.set_extension("class");
    path
}

/// The cache class file that sits next to `class_file`.
pub fn cache_file_next_to(class_file: &Path, cache_class: &str) -> PathBuf {
    let simple = cache_class.rsplit('/').next().unwrap_or(cache_class);
    let file_name = format!("{simple}.class");
    match class_file.parent() {
        Some(dir) => dir.join(file_name),
        None => PathBuf::from(file_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_classes_share_top_level() {
        assert_eq!(top_level_name("com/acme/Foo"), "com/acme/Foo");
        assert_eq!(top_level_name("com/acme/Foo$Bar"), "com/acme/Foo");
        assert_eq!(top_level_name("com/acme/Foo$Bar$1"), "com/acme/Foo");
        assert_eq!(top_level_name("com/acme/Foo$1"), "com/acme/Foo");
        assert_eq!(top_level_name("Foo$Bar"), "Foo");
    }

    #[test]
    fn test_only_simple_name_is_cut() {
        assert_eq!(top_level_name("com/ac$me/Foo$Bar"), "com/ac$me/Foo");
        assert_eq!(top_level_name("com/acme/$Proxy12"), "com/acme/$Proxy12");
        assert_eq!(top_level_name("com/acme/$Gen$Inner"), "com/acme/$Gen");
    }

    #[test]
    fn test_cache_class_name_and_paths() {
        assert_eq!(
            cache_class_name("com/acme/Foo$Bar"),
            "com/acme/Foo$$Log4j2$$Cache"
        );
        assert!(is_cache_class("com/acme/Foo$$Log4j2$$Cache"));
        assert!(!is_cache_class("com/acme/Foo$Bar"));
        assert_eq!(binary_name("com/acme/Foo$Bar"), "com.acme.Foo$Bar");
        assert_eq!(
            class_file_path("com/acme/Foo$Bar"),
            Path::new("com").join("acme").join("Foo$Bar.class")
        );
        assert_eq!(
            cache_file_next_to(Path::new("out/com/acme/Foo$Bar.class"), "com/acme/Foo$$Log4j2$$Cache"),
            Path::new("out/com/acme").join("Foo$$Log4j2$$Cache.class")
        );
    }
}
