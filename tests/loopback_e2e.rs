use anyhow::Result;
use filetime::FileTime;
use skiff::browse::BrowseSession;
use skiff::client::{download, upload, TransferOptions};
use skiff::loopback::LoopbackExecutor;
use skiff::resume::partial_path;
use skiff::session::{Executor, RemoteProcess};
use skiff::TransferError;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    // xorshift noise so gzip can not shrink it
    let mut state: u32 = 0x9e37_79b9 ^ size as u32;
    let mut buf = Vec::with_capacity(size);
    while buf.len() < size {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        buf.push(state as u8);
    }
    f.write_all(&buf)?;
    Ok(())
}

fn s(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn uncompressed() -> TransferOptions {
    TransferOptions {
        compress: false,
        ..TransferOptions::default()
    }
}

/// Delivers only the first `limit` output bytes of the first session, then
/// reports end of stream as if the connection dropped.
struct CuttingExecutor {
    inner: LoopbackExecutor,
    limit: u64,
    used: AtomicBool,
}

impl CuttingExecutor {
    fn new(limit: u64) -> Self {
        Self {
            inner: LoopbackExecutor::new(),
            limit,
            used: AtomicBool::new(false),
        }
    }
}

impl Executor for CuttingExecutor {
    fn execute(&self, command: &str) -> skiff::Result<RemoteProcess> {
        let mut process = self.inner.execute(command)?;
        if !self.used.swap(true, Ordering::SeqCst) {
            process.stdout = Box::new(process.stdout.take(self.limit));
        }
        Ok(process)
    }
}

#[test]
fn directory_download_lands_and_clears_marker() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let tree = src.path().join("tree");
    write_file(&tree.join("a.txt"), 4000)?;
    write_file(&tree.join("nested/b.txt"), 3000)?;
    write_file(&tree.join("c.txt"), 3240)?;

    let dest = dst.path().join("tree");
    let summary = download(
        &LoopbackExecutor::new(),
        &[s(&tree)],
        Some(&dest),
        &TransferOptions::default(),
    )?;
    assert_eq!(summary.files, 3);
    assert_eq!(summary.bytes, 10_240);
    for rel in ["a.txt", "nested/b.txt", "c.txt"] {
        assert_eq!(std::fs::read(dest.join(rel))?, std::fs::read(tree.join(rel))?);
    }
    assert!(!dst.path().join("tree.progress").exists());
    Ok(())
}

#[test]
fn interrupted_raw_download_resumes_at_the_boundary() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let file = src.path().join("big.bin");
    write_file(&file, 1024 * 1024)?;
    let dest = dst.path().join("big.bin");
    let opts = uncompressed();

    // 9 header bytes, then 400 KiB of body
    let cut = CuttingExecutor::new(9 + 400 * 1024);
    let err = download(&cut, &[s(&file)], Some(&dest), &opts).unwrap_err();
    assert!(!matches!(err, TransferError::Spawn { .. }), "{err}");
    assert!(!dest.exists());
    assert_eq!(std::fs::metadata(partial_path(&dest))?.len(), 400 * 1024);

    let summary = download(&LoopbackExecutor::new(), &[s(&file)], Some(&dest), &opts)?;
    assert_eq!(summary.resumed_from, 400 * 1024);
    assert_eq!(summary.bytes, 624 * 1024);
    assert_eq!(std::fs::read(&dest)?, std::fs::read(&file)?);
    assert!(!partial_path(&dest).exists());
    Ok(())
}

#[test]
fn interrupted_compressed_download_resumes() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let file = src.path().join("noise.bin");
    write_file(&file, 512 * 1024)?;
    let dest = dst.path().join("noise.bin");

    let cut = CuttingExecutor::new(200 * 1024);
    assert!(download(&cut, &[s(&file)], Some(&dest), &TransferOptions::default()).is_err());
    let kept = std::fs::metadata(partial_path(&dest))?.len();
    assert!(kept > 0 && kept < 512 * 1024, "kept {kept}");

    let summary = download(
        &LoopbackExecutor::new(),
        &[s(&file)],
        Some(&dest),
        &TransferOptions::default(),
    )?;
    assert_eq!(summary.resumed_from, kept);
    assert_eq!(std::fs::read(&dest)?, std::fs::read(&file)?);
    Ok(())
}

#[test]
fn interrupted_archive_resumes_from_marker() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let tree = src.path().join("set");
    write_file(&tree.join("a.txt"), 10_000)?;
    write_file(&tree.join("b.bin"), 2 * 1024 * 1024)?;
    write_file(&tree.join("c.txt"), 20_000)?;
    let dest = dst.path().join("set");
    let marker = dst.path().join("set.progress");

    let cut = CuttingExecutor::new(1024 * 1024);
    assert!(download(&cut, &[s(&tree)], Some(&dest), &TransferOptions::default()).is_err());
    assert_eq!(std::fs::read_to_string(&marker)?, "b.bin");
    assert_eq!(std::fs::read(dest.join("a.txt"))?, std::fs::read(tree.join("a.txt"))?);

    let summary = download(
        &LoopbackExecutor::new(),
        &[s(&tree)],
        Some(&dest),
        &TransferOptions::default(),
    )?;
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.files, 2);
    for rel in ["a.txt", "b.bin", "c.txt"] {
        assert_eq!(std::fs::read(dest.join(rel))?, std::fs::read(tree.join(rel))?);
    }
    assert!(!marker.exists());
    Ok(())
}

#[test]
fn complete_entries_are_not_rewritten() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let tree = src.path().join("batch");
    std::fs::create_dir_all(&tree)?;
    std::fs::write(tree.join("one.txt"), b"first file")?;
    std::fs::write(tree.join("two.txt"), b"second file")?;

    let dest = dst.path().join("batch");
    std::fs::create_dir_all(&dest)?;
    std::fs::write(dest.join("one.txt"), b"FIRST FILE")?;
    let pinned = FileTime::from_unix_time(1_000_000_000, 0);
    filetime::set_file_mtime(dest.join("one.txt"), pinned)?;

    let summary = download(
        &LoopbackExecutor::new(),
        &[s(&tree)],
        Some(&dest),
        &TransferOptions::default(),
    )?;
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.files, 1);
    assert_eq!(std::fs::read(dest.join("one.txt"))?, b"FIRST FILE");
    let meta = std::fs::metadata(dest.join("one.txt"))?;
    assert_eq!(FileTime::from_last_modification_time(&meta), pinned);
    assert_eq!(std::fs::read(dest.join("two.txt"))?, b"second file");
    Ok(())
}

#[test]
fn stale_partial_larger_than_source_is_discarded() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let file = src.path().join("small.bin");
    write_file(&file, 1000)?;
    let dest = dst.path().join("small.bin");
    std::fs::write(partial_path(&dest), vec![0u8; 5000])?;

    let summary = download(&LoopbackExecutor::new(), &[s(&file)], Some(&dest), &uncompressed())?;
    assert_eq!(summary.resumed_from, 0);
    assert_eq!(std::fs::read(&dest)?, std::fs::read(&file)?);
    Ok(())
}

#[test]
fn several_sources_arrive_side_by_side() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    write_file(&src.path().join("x/report.pdf"), 1500)?;
    write_file(&src.path().join("y/photos/p1.jpg"), 2500)?;
    std::fs::create_dir_all(src.path().join("y/photos/empty"))?;

    let sources = [s(&src.path().join("x/report.pdf")), s(&src.path().join("y/photos"))];
    let dest = dst.path().join("inbox");
    let summary = download(&LoopbackExecutor::new(), &sources, Some(&dest), &TransferOptions::default())?;
    assert_eq!(summary.files, 2);
    assert_eq!(
        std::fs::read(dest.join("report.pdf"))?,
        std::fs::read(src.path().join("x/report.pdf"))?
    );
    assert!(dest.join("photos/p1.jpg").is_file());
    assert!(dest.join("photos/empty").is_dir());
    assert!(!dest.join("report.pdf__photos.progress").exists());
    Ok(())
}

#[test]
fn missing_remote_path_is_a_remote_error() -> Result<()> {
    let dst = tempfile::tempdir()?;
    let err = download(
        &LoopbackExecutor::new(),
        &["/no/such/skiff/path".to_string()],
        Some(&dst.path().join("out")),
        &TransferOptions::default(),
    )
    .unwrap_err();
    match err {
        TransferError::Remote(msg) => assert!(msg.contains("/no/such/skiff/path"), "{msg}"),
        other => panic!("unexpected {other}"),
    }
    Ok(())
}

#[test]
fn upload_directory_and_file() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let tree = src.path().join("site");
    write_file(&tree.join("index.html"), 700)?;
    write_file(&tree.join("assets/app.js"), 9000)?;

    let remote = dst.path().join("www");
    let summary = upload(&LoopbackExecutor::new(), &tree, &s(&remote), &TransferOptions::default())?;
    assert_eq!(summary.files, 2);
    assert_eq!(std::fs::read(remote.join("assets/app.js"))?, std::fs::read(tree.join("assets/app.js"))?);

    // a single file into an existing directory keeps its name
    upload(
        &LoopbackExecutor::new(),
        &tree.join("index.html"),
        &s(dst.path()),
        &uncompressed(),
    )?;
    assert_eq!(std::fs::read(dst.path().join("index.html"))?, std::fs::read(tree.join("index.html"))?);
    Ok(())
}

#[test]
fn upload_replaces_older_remote_files() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let tree = src.path().join("app");
    std::fs::create_dir_all(&tree)?;
    std::fs::write(tree.join("config.txt"), b"NEW-CONTENT-VERSION-2")?;
    std::fs::write(tree.join("same.txt"), b"NEWNEW")?;

    let remote = dst.path().join("app");
    std::fs::create_dir_all(&remote)?;
    std::fs::write(remote.join("config.txt"), b"old-v1")?;
    std::fs::write(remote.join("same.txt"), b"oldold")?;

    let summary = upload(&LoopbackExecutor::new(), &tree, &s(&remote), &TransferOptions::default())?;
    assert_eq!(summary.files, 2);
    assert_eq!(std::fs::read(remote.join("config.txt"))?, b"NEW-CONTENT-VERSION-2");
    assert_eq!(std::fs::read(remote.join("same.txt"))?, b"NEWNEW");
    Ok(())
}

#[test]
fn entering_a_file_keeps_the_current_path() -> Result<()> {
    let root = tempfile::tempdir()?;
    write_file(&root.path().join("notes.txt"), 64)?;
    std::fs::create_dir(root.path().join("docs"))?;
    let location = s(root.path());

    let mut browse = BrowseSession::open(
        Arc::new(LoopbackExecutor::new()),
        &location,
        TransferOptions::default(),
    )?;
    browse.list()?;
    assert!(browse.enter_directory("notes.txt").is_err());
    assert!(browse.enter_directory("ghost").is_err());
    assert_eq!(browse.current_path(), location);

    // the file is still reachable from where we are
    let dst = tempfile::tempdir()?;
    let saved = browse
        .select_file("notes.txt")?
        .save_to(dst.path(), &skiff::progress::Reporter::silent())?;
    assert_eq!(std::fs::read(saved)?, std::fs::read(root.path().join("notes.txt"))?);

    browse.enter_directory("docs")?;
    assert!(browse.list()?.is_empty());
    browse.stop();
    Ok(())
}

#[test]
fn browse_enter_list_and_fetch() -> Result<()> {
    let root = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    write_file(&root.path().join("top.txt"), 10)?;
    write_file(&root.path().join("sub/inner.txt"), 321)?;
    write_file(&root.path().join("sub/deeper/leaf.txt"), 5)?;

    let mut browse = BrowseSession::open(
        Arc::new(LoopbackExecutor::new()),
        &s(root.path()),
        TransferOptions::default(),
    )?;
    let names: Vec<String> = browse.list()?.into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["sub", "top.txt"]);

    browse.enter_directory("sub")?;
    let entries = browse.list()?;
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["deeper", "inner.txt"]);
    assert!(entries[0].is_dir());

    let handle = browse.select_file("inner.txt")?;
    assert_eq!(handle.content_encoding(), Some("gzip"));
    assert_eq!(handle.content_type(), "text/plain");
    assert_eq!(handle.file_name(), "inner.txt");
    let saved = handle.save_to(dst.path(), &skiff::progress::Reporter::silent())?;
    assert_eq!(std::fs::read(saved)?, std::fs::read(root.path().join("sub/inner.txt"))?);

    let handle = browse.select_file("deeper")?;
    assert_eq!(handle.content_type(), "application/gzip");
    assert_eq!(handle.content_disposition(), "attachment; filename=\"deeper.tar.gz\"");
    let mut body = Vec::new();
    handle.into_body_reader().read_to_end(&mut body)?;
    assert_eq!(&body[..2], &[0x1f, 0x8b]);

    // the control stream still works after the side sessions
    assert_eq!(browse.list()?.len(), 2);
    browse.stop();
    Ok(())
}

#[test]
fn raw_body_reader_stops_at_declared_size() -> Result<()> {
    let root = tempfile::tempdir()?;
    write_file(&root.path().join("data.bin"), 4096)?;
    let mut browse = BrowseSession::open(
        Arc::new(LoopbackExecutor::new()),
        &s(root.path()),
        uncompressed(),
    )?;
    let handle = browse.select_file("data.bin")?;
    assert_eq!(handle.content_length(), Some(4096));
    assert_eq!(handle.content_encoding(), None);
    let mut reader = handle.into_body_reader();
    let mut body = Vec::new();
    io::copy(&mut reader, &mut body)?;
    reader.finish()?;
    assert_eq!(body, std::fs::read(root.path().join("data.bin"))?);
    browse.stop();
    Ok(())
}
