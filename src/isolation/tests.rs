use super::{DirectoryJailPreparer, JailConfig, JailPreparer, PathClass, Whitelist};
use std::path::Path;
use tempfile::tempdir;

#[test]
fn prepared_directory_validates_as_jail() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("jail");

    DirectoryJailPreparer
        .prepare(&root)
        .expect("directory preparation should succeed");
    let jail = JailConfig::validate(&root, Whitelist::default()).expect("prepared jail is valid");

    assert!(jail.contains(&jail.root().join("nested/file")));
}

#[test]
fn extra_whitelist_prefix_exempts_paths_outside_jail() {
    let tmp = tempdir().unwrap();
    let whitelist = Whitelist::default().with_extra(["/opt/runtime"]);
    let jail = JailConfig::validate(tmp.path(), whitelist).unwrap();

    assert_eq!(
        jail.classify(Path::new("/opt/runtime/lib/libfoo.so")),
        PathClass::Whitelisted
    );
    assert_eq!(
        jail.classify(Path::new("/opt/other/file")),
        PathClass::Violation
    );
}

#[test]
fn empty_whitelist_flags_device_nodes() {
    let tmp = tempdir().unwrap();
    let jail = JailConfig::validate(tmp.path(), Whitelist::empty()).unwrap();
    assert_eq!(jail.classify(Path::new("/dev/null")), PathClass::Violation);
}

#[cfg(unix)]
#[test]
fn symlinked_jail_resolves_to_target() {
    let tmp = tempdir().unwrap();
    let real = tmp.path().join("real");
    std::fs::create_dir(&real).unwrap();
    let link = tmp.path().join("link");
    std::os::unix::fs::symlink(&real, &link).unwrap();

    let jail = JailConfig::validate(&link, Whitelist::default()).unwrap();
    let canonical = real.canonicalize().unwrap();
    assert_eq!(jail.root(), canonical);
    assert_eq!(
        jail.classify(&canonical.join("x")),
        PathClass::InsideJail
    );
}
