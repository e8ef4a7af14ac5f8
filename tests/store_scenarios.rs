//! Black-box scenario tests driving the public `Store` API end to end against a temporary
//! store root, rather than exercising internal module functions directly.

use std::fs;

use qnix_store::{Config, Store};

fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.store.store_path = dir.join("store");
    config.store.profiles_path = dir.join("profiles");
    config
}

#[test]
fn s1_init_produces_the_expected_layout() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    Store::init(&config.store.store_path, config.clone()).unwrap();

    assert!(config.store.store_path.is_dir());
    assert!(config.store.store_path.join(".nix-db").is_dir());
}

#[test]
fn s2_single_file_import_has_the_expected_shape() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut store = Store::init(&config.store.store_path, config.clone()).unwrap();

    let src = dir.path().join("hello");
    fs::write(&src, [0x42u8]).unwrap();

    let id = store.add(&src, "hello").unwrap();
    assert!(id.as_str().ends_with("-hello"));
    assert_eq!(id.hash_hex().len(), 64);

    let object_path = id.to_path(&config.store.store_path);
    assert!(object_path.join("bin").join("hello").is_file());
    assert!(store.query_references(&id).is_empty());

    let expected = qnix_store::hash::hash_file("hello", &src).unwrap();
    assert_eq!(store.registry().get_hash(&object_path), Some(expected.as_str()));
}

#[test]
fn s3_reimporting_the_same_file_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut store = Store::init(&config.store.store_path, config.clone()).unwrap();

    let src = dir.path().join("hello");
    fs::write(&src, b"x").unwrap();

    let first = store.add(&src, "hello").unwrap();
    let second = store.add(&src, "hello").unwrap();

    assert_eq!(first, second);
    assert_eq!(store.registry().entries().count(), 1);
}

#[test]
fn s4_add_root_on_nonexistent_object_fails_and_roots_are_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut store = Store::init(&config.store.store_path, config).unwrap();

    let bogus: qnix_store::ObjectId = format!("{}-missing", "a".repeat(64)).parse().unwrap();
    assert!(store.add_root(&bogus).is_err());
    assert_eq!(store.registry().roots().count(), 0);
}

#[test]
fn s5_gc_preserves_a_root_and_its_reference_but_sweeps_an_unrelated_object() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut store = Store::init(&config.store.store_path, config.clone()).unwrap();

    let dep_src = dir.path().join("libb");
    fs::write(&dep_src, b"b").unwrap();
    let dep_id = store.add(&dep_src, "libb").unwrap();

    let mut deps = std::collections::BTreeSet::new();
    deps.insert(dep_id.clone());
    let app_src = dir.path().join("appa");
    fs::write(&app_src, b"a").unwrap();
    let app_id = store.add_with_explicit_deps(&app_src, "appa", &deps).unwrap();
    store.add_root(&app_id).unwrap();

    let unrelated_src = dir.path().join("cee");
    fs::write(&unrelated_src, b"c").unwrap();
    let unrelated_id = store.add(&unrelated_src, "cee").unwrap();

    let report = store.collect_garbage().unwrap();

    let app_path = app_id.to_path(&config.store.store_path);
    let dep_path = dep_id.to_path(&config.store.store_path);
    let unrelated_path = unrelated_id.to_path(&config.store.store_path);

    assert!(app_path.exists());
    assert!(dep_path.exists());
    assert!(!unrelated_path.exists());
    assert!(report.swept.contains(&unrelated_path));
    assert!(!report.swept.contains(&app_path));
    assert!(!report.swept.contains(&dep_path));
}

#[test]
fn s6_rollback_restores_the_pre_install_profile_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut store = Store::init(&config.store.store_path, config.clone()).unwrap();

    store.create_profile("p").unwrap();

    let src = dir.path().join("tool");
    fs::create_dir_all(&src).unwrap();
    fs::create_dir_all(src.join("bin")).unwrap();
    fs::write(src.join("bin").join("tool"), b"exe").unwrap();
    let id = store.add(&src, "tool").unwrap();

    store.install(&id, "p").unwrap();
    assert!(config
        .store
        .profiles_path
        .join("p")
        .join("bin")
        .join("tool")
        .exists());

    store.rollback("p").unwrap();

    assert!(!config
        .store
        .profiles_path
        .join("p")
        .join("bin")
        .join("tool")
        .exists());
}

#[test]
fn s7_generation_retention_keeps_only_the_most_recent() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.profiles.max_generations = 3;
    let mut store = Store::init(&config.store.store_path, config.clone()).unwrap();

    store.create_profile("p").unwrap();

    for i in 0..4 {
        let src = dir.path().join(format!("tool{i}"));
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin").join("tool"), format!("exe{i}")).unwrap();
        let id = store.add(&src, &format!("tool{i}")).unwrap();
        store.install(&id, "p").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
    }

    let generations = store.list_generations("p").unwrap();
    assert_eq!(generations.len(), 3);
}
