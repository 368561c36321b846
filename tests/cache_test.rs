use stream_bridge::engine::cache::DiskCache;

const MB: u64 = 1024 * 1024;

#[test]
fn test_disk_cache_put_and_read_range() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DiskCache::new(dir.path(), "item0", 10 * MB, 2 * MB).unwrap();

    assert_eq!(cache.total_chunks(), 5);
    assert!(!cache.has_chunk(0));

    let data: Vec<u8> = (0..2 * MB).map(|i| (i % 251) as u8).collect();
    cache.put_chunk(0, &data).unwrap();

    assert!(cache.has_chunk(0));
    assert!(!cache.has_chunk(1));
    assert_eq!(cache.cached_bytes(), 2 * MB);

    let window = cache.read_range(100, 200).unwrap();
    assert_eq!(&window[..], &data[100..200]);

    // Any missing chunk in the window makes the read fail.
    assert!(cache.read_range(2 * MB - 10, 2 * MB + 10).is_none());
}

#[test]
fn test_disk_cache_last_chunk_shorter() {
    let dir = tempfile::tempdir().unwrap();
    // 5 MB with 2 MB chunks => 2, 2, 1 MB.
    let cache = DiskCache::new(dir.path(), "item1", 5 * MB, 2 * MB).unwrap();

    assert_eq!(cache.total_chunks(), 3);
    assert_eq!(cache.chunk_len(0), 2 * MB as usize);
    assert_eq!(cache.chunk_len(2), MB as usize);

    let tail = vec![0xCDu8; MB as usize];
    cache.put_chunk(2, &tail).unwrap();
    assert_eq!(cache.read_range(4 * MB, 5 * MB).unwrap().len(), MB as usize);
    assert_eq!(cache.cached_bytes(), MB);
}

#[test]
fn test_disk_cache_rejects_out_of_range_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DiskCache::new(dir.path(), "item2", 3 * MB, 2 * MB).unwrap();
    assert!(cache.put_chunk(7, &[0u8; 16]).is_err());
    assert!(!cache.has_chunk(7));
}

#[test]
fn test_disk_cache_file_removed_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DiskCache::new(dir.path(), "item3", MB, MB).unwrap();
    let path = cache.path().to_path_buf();
    assert!(path.exists());
    drop(cache);
    assert!(!path.exists());
}
