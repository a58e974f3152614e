use beaverkv::{Error, KV};
use once_cell::sync::Lazy;
use std::path::PathBuf;
use tempfile::TempDir;

static TRACING: Lazy<()> = Lazy::new(|| {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
});

fn open_temp() -> (TempDir, PathBuf, KV) {
    Lazy::force(&TRACING);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.data");
    let kv = KV::open(&path).unwrap();
    (dir, path, kv)
}

#[test]
fn first_insert_then_lookup() {
    let (_dir, _path, mut kv) = open_temp();
    kv.set(b"k1", b"mickey1").unwrap();
    assert_eq!(kv.get(b"k1").unwrap(), Some(b"mickey1".to_vec()));
}

#[test]
fn many_inserts_stay_searchable() {
    let (_dir, _path, mut kv) = open_temp();
    for i in 1..10 {
        kv.set(format!("k{}", i).as_bytes(), format!("mickey{}", i).as_bytes())
            .unwrap();
    }
    assert_eq!(kv.get(b"k1").unwrap(), Some(b"mickey1".to_vec()));
    assert_eq!(kv.get(b"k5").unwrap(), Some(b"mickey5".to_vec()));
}

#[test]
fn delete_then_idempotent_miss() {
    let (_dir, _path, mut kv) = open_temp();
    for i in 1..10 {
        kv.set(format!("k{}", i).as_bytes(), format!("mickey{}", i).as_bytes())
            .unwrap();
    }

    assert!(kv.del(b"k9").unwrap());
    assert_eq!(kv.get(b"k9").unwrap(), None);
    assert!(matches!(kv.del(b"k9"), Err(Error::NotFound)));
    assert_eq!(kv.get(b"k8").unwrap(), Some(b"mickey8".to_vec()));
}

#[test]
fn oversized_requests_are_rejected_without_side_effects() {
    let (_dir, _path, mut kv) = open_temp();
    kv.set(b"kept", b"value").unwrap();

    let long_key = vec![b'x'; 1001];
    assert!(matches!(kv.set(&long_key, b"x"), Err(Error::Limit(_))));
    let long_val = vec![b'x'; 3001];
    assert!(matches!(kv.set(b"k", &long_val), Err(Error::Limit(_))));

    assert_eq!(kv.get(b"kept").unwrap(), Some(b"value".to_vec()));
    assert_eq!(kv.get(b"k").unwrap(), None);
}

#[test]
fn boundary_sizes_are_accepted() {
    let (_dir, _path, mut kv) = open_temp();
    let key = vec![b'k'; 1000];
    let val = vec![b'v'; 3000];
    kv.set(&key, &val).unwrap();
    assert_eq!(kv.get(&key).unwrap(), Some(val));
}

#[test]
fn committed_writes_survive_a_reopen() {
    let (_dir, path, mut kv) = open_temp();
    kv.set(b"a", b"1").unwrap();
    kv.set(b"b", b"2").unwrap();
    kv.close();

    let kv = KV::open(&path).unwrap();
    assert_eq!(kv.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(kv.get(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn replacements_survive_a_reopen() {
    let (_dir, path, mut kv) = open_temp();
    kv.set(b"a", b"old").unwrap();
    kv.set(b"a", b"new").unwrap();
    kv.close();

    let kv = KV::open(&path).unwrap();
    assert_eq!(kv.get(b"a").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn grows_and_shrinks_through_many_commits() {
    let (_dir, path, mut kv) = open_temp();

    // enough volume to split the tree several levels deep and cycle plenty
    // of pages through the free list
    let val = vec![b'v'; 500];
    for i in 0..300u32 {
        kv.set(format!("key-{:04}", i).as_bytes(), &val).unwrap();
    }
    for i in 0..300u32 {
        if i % 3 != 0 {
            assert!(kv.del(format!("key-{:04}", i).as_bytes()).unwrap());
        }
    }
    for i in 300..400u32 {
        kv.set(format!("key-{:04}", i).as_bytes(), &val).unwrap();
    }
    kv.close();

    let kv = KV::open(&path).unwrap();
    for i in 0..400u32 {
        let key = format!("key-{:04}", i);
        let expect = i >= 300 || i % 3 == 0;
        assert_eq!(
            kv.get(key.as_bytes()).unwrap(),
            expect.then(|| val.clone()),
            "unexpected state for {}",
            key
        );
    }
}

#[test]
fn recycling_keeps_the_file_from_growing_without_bound() {
    let (_dir, path, mut kv) = open_temp();
    let val = vec![b'v'; 100];

    // steady-state churn over a fixed key set
    for round in 0..50u32 {
        let key = format!("churn-{}", round % 5);
        kv.set(key.as_bytes(), &val).unwrap();
    }
    kv.close();

    let size = std::fs::metadata(&path).unwrap().len();
    // two doublings from the initial extension is already generous here
    assert!(size <= 256 << 10, "file grew to {} bytes", size);

    let kv = KV::open(&path).unwrap();
    for i in 0..5u32 {
        assert_eq!(kv.get(format!("churn-{}", i).as_bytes()).unwrap(), Some(val.clone()));
    }
}
