//! End-to-end name transcoding over a real scratch directory.
//!
//! The storage side holds GBK-encoded filenames; callers see UTF-8. The
//! scenarios mirror a mount of a legacy fileserver tree from a modern
//! locale.

use convmvfs_core::{Caller, ConvFs, MountConfig};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

// "日志" in GBK
const LOG_GBK: [u8; 4] = [0xC8, 0xD5, 0xD6, 0xBE];
// "报告" in GBK
const REPORT_GBK: [u8; 4] = [0xB1, 0xA8, 0xB8, 0xE6];

fn caller() -> Caller {
    Caller::new(
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    )
}

fn gbk_mount() -> (tempfile::TempDir, ConvFs) {
    let dir = tempfile::tempdir().unwrap();
    let fs = ConvFs::new(MountConfig::new(dir.path(), "GBK", "UTF-8").unwrap());
    (dir, fs)
}

fn storage_name(dir: &tempfile::TempDir, bytes: &[u8]) -> PathBuf {
    dir.path().join(OsString::from_vec(bytes.to_vec()))
}

#[test]
fn test_getattr_resolves_utf8_name_to_gbk_storage() {
    let (dir, fs) = gbk_mount();
    let mut name = LOG_GBK.to_vec();
    name.extend_from_slice(b".txt");
    std::fs::write(storage_name(&dir, &name), b"2024-01-01 ok").unwrap();

    let st = fs.getattr(OsStr::new("/日志.txt"), caller()).unwrap();
    assert_eq!(st.st_size, 13);
}

#[test]
fn test_readdir_presents_utf8_names() {
    let (dir, fs) = gbk_mount();
    let mut name = LOG_GBK.to_vec();
    name.extend_from_slice(b".txt");
    std::fs::write(storage_name(&dir, &name), b"x").unwrap();
    std::fs::write(dir.path().join("plain.txt"), b"y").unwrap();

    let entries = fs.readdir(OsStr::new("/")).unwrap();
    let names: Vec<OsString> = entries.into_iter().map(|e| e.name).collect();
    assert!(names.contains(&OsString::from("日志.txt")));
    assert!(names.contains(&OsString::from("plain.txt")));
}

#[test]
fn test_mkdir_writes_gbk_bytes_to_storage() {
    let (dir, fs) = gbk_mount();
    fs.mkdir(OsStr::new("/报告"), 0o755, caller()).unwrap();

    assert!(storage_name(&dir, &REPORT_GBK).is_dir());
    // And the caller-side view resolves back
    let st = fs.getattr(OsStr::new("/报告"), caller()).unwrap();
    assert_eq!(st.st_mode as u32 & libc::S_IFMT, libc::S_IFDIR);
}

#[test]
fn test_nested_lookup_through_transcoded_directory() {
    let (dir, fs) = gbk_mount();
    let sub = storage_name(&dir, &REPORT_GBK);
    std::fs::create_dir(&sub).unwrap();
    let mut inner = LOG_GBK.to_vec();
    inner.extend_from_slice(b".txt");
    std::fs::write(sub.join(OsString::from_vec(inner)), b"abc").unwrap();

    let st = fs.getattr(OsStr::new("/报告/日志.txt"), caller()).unwrap();
    assert_eq!(st.st_size, 3);
}

#[test]
fn test_symlink_target_stored_in_gbk() {
    let (dir, fs) = gbk_mount();
    fs.symlink(OsStr::new("日志.txt"), OsStr::new("/ln"), caller())
        .unwrap();

    let target = std::fs::read_link(dir.path().join("ln")).unwrap();
    let mut expected = LOG_GBK.to_vec();
    expected.extend_from_slice(b".txt");
    assert_eq!(target.as_os_str().as_bytes(), expected.as_slice());

    // readlink transcodes the target back to the caller charset
    assert_eq!(
        fs.readlink(OsStr::new("/ln"), caller()).unwrap(),
        OsString::from("日志.txt")
    );
}

#[test]
fn test_truncated_storage_name_degrades_with_sentinel() {
    let (dir, fs) = gbk_mount();
    // "a" followed by a lone GBK lead byte: undecodable tail
    std::fs::write(storage_name(&dir, &[b'a', 0x81]), b"x").unwrap();

    let entries = fs.readdir(OsStr::new("/")).unwrap();
    let names: Vec<OsString> = entries.into_iter().map(|e| e.name).collect();
    assert!(
        names.contains(&OsString::from("a???")),
        "degraded name missing from {names:?}"
    );
}

#[test]
fn test_file_io_through_transcoded_path() {
    let (dir, fs) = gbk_mount();
    let mut name = LOG_GBK.to_vec();
    name.extend_from_slice(b".txt");
    std::fs::write(storage_name(&dir, &name), b"old contents").unwrap();

    let vpath = OsStr::new("/日志.txt");
    fs.open(vpath, libc::O_RDWR, caller()).unwrap();
    assert_eq!(fs.read(vpath, 0, 3).unwrap(), b"old");
    fs.write(vpath, 0, b"new").unwrap();
    fs.release(vpath).unwrap();

    assert_eq!(
        std::fs::read(storage_name(&dir, &name)).unwrap(),
        b"new contents"
    );
}

#[test]
fn test_rename_across_charsets() {
    let (dir, fs) = gbk_mount();
    std::fs::write(dir.path().join("plain"), b"x").unwrap();

    fs.rename(OsStr::new("/plain"), OsStr::new("/报告"), caller())
        .unwrap();
    assert!(storage_name(&dir, &REPORT_GBK).exists());
}
