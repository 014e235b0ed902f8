// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The cache proper. On disk, every key is one file: an 8-byte fixed
//! header, the opaque ETag, then exactly `content_length` body bytes.
//! Fetches revalidate with `If-None-Match` and either rewrite the final
//! file in place or stage into `p/` and rename into `f/` once every byte
//! has been flushed.

use crate::fs::{DirectoryRoot, Filesystem, FsError};
use crate::transport::{FetchHandler, FetchTransport, TransportResult};
use adk_alloc::{Heap, Region, SharedHeap};
use adk_common::http::{parse_header_value, parse_numeric_header, parse_status_line};
use allocator_api2::vec::Vec as HeapVec;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

const CACHE_FILE_VERSION: u8 = 1;
const FILE_TYPE_HTTP: u8 = 1;
const FILE_HEADER_SIZE: usize = 8;

/// `Atomic` stages into `p/{key}` and renames to `f/{key}` on
/// completion; `InPlace` rewrites `f/{key}` directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    Atomic,
    InPlace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The server returned a fresh body (HTTP 200).
    Updated,
    /// The stored ETag still matches (HTTP 304).
    AlreadyCached,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("response carried an invalid or missing content length")]
    InvalidContentLength,
    #[error("cache file could not be opened or written")]
    FileOpenFailure,
    #[error("finalizing rename failed for the key")]
    KeyMoveFailure,
    #[error("cached file has an unsupported version")]
    InvalidVersion,
    #[error("cached file has an unsupported header type")]
    InvalidFileHeaderType,
    #[error("http request failed with status {status}")]
    HttpRequestFailed { status: u16 },
    #[error("cache file is invalid")]
    InvalidCacheFile,
}

#[derive(Debug, Error)]
pub enum GetError {
    #[error("key is not cached")]
    NotFound,
    #[error("cached file header is invalid")]
    InvalidHeader,
    #[error("cached content length mismatch: header says {expected}, file holds {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An opened cache hit: the handle is positioned at the first body byte.
#[derive(Debug)]
pub struct CacheContent {
    pub file: File,
    pub content_size: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheFileHeader {
    version: u8,
    file_type: u8,
    etag_length: u16,
    content_length: u32,
}

impl CacheFileHeader {
    fn to_bytes(self) -> [u8; FILE_HEADER_SIZE] {
        let mut raw = [0u8; FILE_HEADER_SIZE];
        raw[0] = self.version;
        raw[1] = self.file_type;
        raw[2..4].copy_from_slice(&self.etag_length.to_le_bytes());
        raw[4..8].copy_from_slice(&self.content_length.to_le_bytes());
        raw
    }

    fn from_bytes(raw: [u8; FILE_HEADER_SIZE]) -> Self {
        Self {
            version: raw[0],
            file_type: raw[1],
            etag_length: u16::from_le_bytes([raw[2], raw[3]]),
            content_length: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }
}

pub struct Cache {
    fs: Arc<Filesystem>,
    subdirectory: String,
    heap: SharedHeap,
}

impl Cache {
    /// Initializes a private heap in `region` and creates the cache
    /// directory layout (`{subdir}/p/`, `{subdir}/f/`).
    pub fn create(fs: Arc<Filesystem>, subdirectory: &str, region: Region) -> Result<Self, FsError> {
        let cache = Self {
            fs,
            subdirectory: subdirectory.trim_end_matches('/').to_owned(),
            heap: SharedHeap::new(Heap::new(region, 8, 0, "cache")),
        };
        cache.create_directories()?;
        Ok(cache)
    }

    fn create_directories(&self) -> Result<(), FsError> {
        self.fs
            .create_directory_path(DirectoryRoot::AppCache, &self.subdirectory)?;
        self.fs
            .create_directory_path(DirectoryRoot::AppCache, &format!("{}/p", self.subdirectory))?;
        self.fs
            .create_directory_path(DirectoryRoot::AppCache, &format!("{}/f", self.subdirectory))?;
        Ok(())
    }

    fn partial_path(&self, key: &str) -> String {
        format!("{}/p/{key}", self.subdirectory)
    }

    fn final_path(&self, key: &str) -> String {
        format!("{}/f/{key}", self.subdirectory)
    }

    /// Deletes and recreates the whole cache subdirectory.
    pub fn clear(&self) -> Result<(), FsError> {
        self.fs
            .delete_directory(DirectoryRoot::AppCache, &self.subdirectory)?;
        self.create_directories()
    }

    /// Removes the finalized file for `key`; in-flight partials are left
    /// alone.
    pub fn delete_key(&self, key: &str) {
        if let Err(err) = self.fs.delete_file(DirectoryRoot::AppCache, &self.final_path(key)) {
            debug!(key, %err, "delete_key had nothing to remove");
        }
    }

    /// Opens the finalized file for `key`, validates the stored header
    /// against the actual file length, and returns the handle positioned
    /// at the first body byte.
    pub fn get(&self, key: &str) -> Result<CacheContent, GetError> {
        let path = self.final_path(key);
        let mut file = match self.fs.open_read(DirectoryRoot::AppCache, &path) {
            Ok(file) => file,
            Err(FsError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                return Err(GetError::NotFound)
            }
            Err(err) => return Err(err.into()),
        };

        let mut raw = [0u8; FILE_HEADER_SIZE];
        file.read_exact(&mut raw).map_err(|_| GetError::InvalidHeader)?;
        let header = CacheFileHeader::from_bytes(raw);
        if header.version != CACHE_FILE_VERSION || header.file_type != FILE_TYPE_HTTP {
            error!(key, version = header.version, "cached file header rejected");
            return Err(GetError::InvalidHeader);
        }
        debug!(key, "reading cached version");

        // Skip the ETag, then verify the body length against the header.
        file.seek(SeekFrom::Current(header.etag_length as i64))?;
        let head = file.stream_position()?;
        let tail = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(head))?;

        let actual = tail - head;
        if actual != header.content_length as u64 {
            error!(
                key,
                expected = header.content_length,
                actual,
                "cached content length does not match header"
            );
            return Err(GetError::LengthMismatch {
                expected: header.content_length as u64,
                actual,
            });
        }

        Ok(CacheContent {
            file,
            content_size: header.content_length as u64,
        })
    }

    /// Fetches `url` into the cache under `key`. A stored ETag is offered
    /// as `If-None-Match`; 304 reuses the cached bytes, 200 rewrites them
    /// under the chosen [UpdateMode].
    pub fn fetch(
        &self,
        transport: &dyn FetchTransport,
        key: &str,
        url: &str,
        update_mode: UpdateMode,
    ) -> Result<FetchOutcome, FetchError> {
        let mut stored_content_length = 0u32;
        let mut request_headers = Vec::new();

        if let Ok(mut file) = self.fs.open_read(DirectoryRoot::AppCache, &self.final_path(key)) {
            let mut raw = [0u8; FILE_HEADER_SIZE];
            if file.read_exact(&mut raw).is_ok() {
                let header = CacheFileHeader::from_bytes(raw);
                if header.version != CACHE_FILE_VERSION {
                    return Err(FetchError::InvalidVersion);
                }
                if header.file_type != FILE_TYPE_HTTP {
                    return Err(FetchError::InvalidFileHeaderType);
                }
                stored_content_length = header.content_length;

                let mut etag: HeapVec<u8, &SharedHeap> = HeapVec::new_in(&self.heap);
                etag.resize(header.etag_length as usize, 0);
                if file.read_exact(&mut etag).is_ok() && !etag.is_empty() {
                    let etag = String::from_utf8_lossy(&etag);
                    request_headers.push(format!("If-None-Match: {etag}"));
                }
            }
        }

        let mut ctx = RequestCtx {
            cache: self,
            key,
            update_mode,
            etag: String::new(),
            content_size: 0,
            recv_state: RecvState::Init,
            recv_count: 0,
            recv_file: None,
            response_code: 0,
            result: None,
            error: None,
        };
        transport.fetch(&self.heap, url, &request_headers, &mut ctx);

        if let Some(error) = ctx.error {
            return Err(error);
        }

        let effective_length = match ctx.response_code {
            304 => {
                debug!(key, url, "server confirmed the cached version");
                stored_content_length
            }
            200 => ctx.content_size as u32,
            status => {
                error!(key, url, status, result = ?ctx.result, "failed to fetch resource");
                return Err(FetchError::HttpRequestFailed { status });
            }
        };
        if effective_length == 0 {
            return Err(FetchError::InvalidCacheFile);
        }

        Ok(if ctx.response_code == 304 {
            FetchOutcome::AlreadyCached
        } else {
            FetchOutcome::Updated
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecvState {
    Init,
    Append,
    Skip,
}

/// Per-fetch state threaded through the transport callbacks; lives from
/// just before the fetch until after the completion callback.
struct RequestCtx<'c> {
    cache: &'c Cache,
    key: &'c str,
    update_mode: UpdateMode,
    etag: String,
    content_size: usize,
    recv_state: RecvState,
    recv_count: usize,
    recv_file: Option<File>,
    response_code: u16,
    result: Option<TransportResult>,
    error: Option<FetchError>,
}

impl FetchHandler for RequestCtx<'_> {
    fn on_header(&mut self, line: &[u8]) -> bool {
        if self.response_code == 0 {
            if let Some(code) = parse_status_line(line) {
                self.response_code = code;
                if code != 200 {
                    self.recv_state = RecvState::Skip;
                }
            }
        }
        if let Some(value) = parse_header_value("ETag", line) {
            self.etag = value.to_owned();
        }
        if let Some(value) = parse_numeric_header("Content-Length", line) {
            self.content_size = value as usize;
        }
        true
    }

    fn on_body(&mut self, chunk: &[u8]) -> bool {
        if self.error.is_some() {
            return false;
        }
        if self.content_size == 0 {
            error!(key = self.key, "invalid or no content length in response header");
            self.error = Some(FetchError::InvalidContentLength);
            return false;
        }

        if self.recv_state == RecvState::Init {
            let path = match self.update_mode {
                UpdateMode::Atomic => self.cache.partial_path(self.key),
                UpdateMode::InPlace => self.cache.final_path(self.key),
            };
            match self.cache.fs.open_write(DirectoryRoot::AppCache, &path) {
                Ok(mut file) => {
                    let header = CacheFileHeader {
                        version: CACHE_FILE_VERSION,
                        file_type: FILE_TYPE_HTTP,
                        etag_length: self.etag.len() as u16,
                        content_length: self.content_size as u32,
                    };
                    if file.write_all(&header.to_bytes()).is_err()
                        || file.write_all(self.etag.as_bytes()).is_err()
                    {
                        self.error = Some(FetchError::FileOpenFailure);
                        return false;
                    }
                    self.recv_file = Some(file);
                    self.recv_state = RecvState::Append;
                }
                Err(err) => {
                    error!(key = self.key, %err, "failed to open cache file");
                    self.error = Some(FetchError::FileOpenFailure);
                    return false;
                }
            }
        }

        if self.recv_state == RecvState::Append {
            let Some(file) = self.recv_file.as_mut() else {
                self.recv_state = RecvState::Skip;
                return true;
            };
            if file.write_all(chunk).is_err() {
                self.error = Some(FetchError::FileOpenFailure);
                return false;
            }
            self.recv_count += chunk.len();

            if self.recv_count >= self.content_size {
                // Close (flushing) before any rename so the finalized
                // path never names a short file.
                if let Some(mut file) = self.recv_file.take() {
                    let _ = file.flush();
                }
                if self.update_mode == UpdateMode::Atomic {
                    let from = self.cache.partial_path(self.key);
                    let to = self.cache.final_path(self.key);
                    if let Err(err) = self.cache.fs.rename(DirectoryRoot::AppCache, &from, &to) {
                        error!(key = self.key, %err, "failed to finalize atomic cache update");
                        self.error = Some(FetchError::KeyMoveFailure);
                        return false;
                    }
                }
            }
        }

        true
    }

    fn on_complete(&mut self, result: TransportResult, http_status: u16) {
        if self.recv_file.take().is_some() {
            // Not expected: completion fired while the body was still
            // being written.
            error!(key = self.key, "http request completed before resource fully received");
        }
        if result != TransportResult::Ok {
            error!(key = self.key, ?result, "http request failed");
        }
        self.result = Some(result);
        self.response_code = http_status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::NonNull;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct TestRegion {
        _backing: Vec<u64>,
        region: Region,
    }

    fn test_region(size: usize) -> TestRegion {
        let mut backing = vec![0u64; size / 8 + 8];
        let raw = backing.as_mut_ptr() as usize;
        let aligned = (raw + 63) & !63;
        TestRegion {
            region: Region::new(NonNull::new(aligned as *mut u8).unwrap(), size),
            _backing: backing,
        }
    }

    struct Served {
        etag: String,
        body: Vec<u8>,
    }

    /// Canned-response transport: serves one resource per URL, honors
    /// If-None-Match, and copies the body through a heap-backed scratch
    /// buffer the way the real transport does.
    #[derive(Default)]
    struct MockTransport {
        resources: Mutex<HashMap<String, Served>>,
        fail_transport: Mutex<bool>,
    }

    impl MockTransport {
        fn serve(&self, url: &str, etag: &str, body: &[u8]) {
            self.resources.lock().unwrap().insert(
                url.to_owned(),
                Served {
                    etag: etag.to_owned(),
                    body: body.to_vec(),
                },
            );
        }
    }

    impl FetchTransport for MockTransport {
        fn fetch(
            &self,
            heap: &SharedHeap,
            url: &str,
            request_headers: &[String],
            handler: &mut dyn FetchHandler,
        ) {
            if *self.fail_transport.lock().unwrap() {
                handler.on_complete(TransportResult::Error, 0);
                return;
            }

            let resources = self.resources.lock().unwrap();
            let Some(resource) = resources.get(url) else {
                handler.on_header(b"HTTP/1.1 404 Not Found\r\n");
                handler.on_complete(TransportResult::Ok, 404);
                return;
            };

            let revalidated = request_headers.iter().any(|header| {
                header
                    .strip_prefix("If-None-Match: ")
                    .is_some_and(|etag| etag == resource.etag)
            });
            if revalidated {
                handler.on_header(b"HTTP/1.1 304 Not Modified\r\n");
                handler.on_header(format!("ETag: {}\r\n", resource.etag).as_bytes());
                handler.on_complete(TransportResult::Ok, 304);
                return;
            }

            handler.on_header(b"HTTP/1.1 200 OK\r\n");
            handler.on_header(format!("ETag: {}\r\n", resource.etag).as_bytes());
            handler.on_header(format!("Content-Length: {}\r\n", resource.body.len()).as_bytes());

            let mut scratch: HeapVec<u8, &SharedHeap> = HeapVec::new_in(heap);
            scratch.extend_from_slice(&resource.body);
            for chunk in scratch.chunks(7) {
                if !handler.on_body(chunk) {
                    break;
                }
            }
            handler.on_complete(TransportResult::Ok, 200);
        }
    }

    fn harness() -> (tempfile::TempDir, TestRegion, Cache, MockTransport) {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(Filesystem::new(
            dir.path().join("root"),
            dir.path().join("config"),
            dir.path().join("cache"),
        ));
        let mem = test_region(256 * 1024);
        let cache = Cache::create(Arc::clone(&fs), "assets", mem.region).unwrap();
        (dir, mem, cache, MockTransport::default())
    }

    fn read_body(content: &mut CacheContent) -> Vec<u8> {
        let mut body = vec![0u8; content.content_size as usize];
        content.file.read_exact(&mut body).unwrap();
        body
    }

    const LOGO_URL: &str = "https://assets.example/logo.bin";
    const LOGO_BODY: &[u8] = b"binary logo payload of a reasonable length";

    #[test]
    fn fetch_then_get_round_trips() {
        let (_dir, _mem, cache, transport) = harness();
        transport.serve(LOGO_URL, "\"v1\"", LOGO_BODY);

        let outcome = cache.fetch(&transport, "logo", LOGO_URL, UpdateMode::Atomic).unwrap();
        assert_eq!(outcome, FetchOutcome::Updated);

        let mut content = cache.get("logo").unwrap();
        assert_eq!(content.content_size, LOGO_BODY.len() as u64);
        assert_eq!(read_body(&mut content), LOGO_BODY);
    }

    #[test]
    fn second_fetch_is_already_cached_and_bytes_are_unchanged() {
        let (dir, _mem, cache, transport) = harness();
        transport.serve(LOGO_URL, "\"v1\"", LOGO_BODY);

        cache.fetch(&transport, "logo", LOGO_URL, UpdateMode::Atomic).unwrap();
        let first = std::fs::read(dir.path().join("cache/assets/f/logo")).unwrap();

        let outcome = cache.fetch(&transport, "logo", LOGO_URL, UpdateMode::Atomic).unwrap();
        assert_eq!(outcome, FetchOutcome::AlreadyCached);

        let second = std::fs::read(dir.path().join("cache/assets/f/logo")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn atomic_update_leaves_partial_directory_empty() {
        let (dir, _mem, cache, transport) = harness();
        transport.serve(LOGO_URL, "\"v1\"", LOGO_BODY);

        cache.fetch(&transport, "logo", LOGO_URL, UpdateMode::Atomic).unwrap();

        let partials: Vec<_> = std::fs::read_dir(dir.path().join("cache/assets/p"))
            .unwrap()
            .collect();
        assert!(partials.is_empty());
        assert!(dir.path().join("cache/assets/f/logo").exists());
    }

    #[test]
    fn in_place_update_writes_final_path_directly() {
        let (dir, _mem, cache, transport) = harness();
        transport.serve(LOGO_URL, "\"v1\"", LOGO_BODY);

        cache.fetch(&transport, "logo", LOGO_URL, UpdateMode::InPlace).unwrap();

        assert!(dir.path().join("cache/assets/f/logo").exists());
        let partials: Vec<_> = std::fs::read_dir(dir.path().join("cache/assets/p"))
            .unwrap()
            .collect();
        assert!(partials.is_empty());

        let mut content = cache.get("logo").unwrap();
        assert_eq!(read_body(&mut content), LOGO_BODY);
    }

    #[test]
    fn appended_byte_breaks_get() {
        let (dir, _mem, cache, transport) = harness();
        transport.serve(LOGO_URL, "\"v1\"", LOGO_BODY);
        cache.fetch(&transport, "logo", LOGO_URL, UpdateMode::Atomic).unwrap();

        let path = dir.path().join("cache/assets/f/logo");
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        assert!(matches!(
            cache.get("logo"),
            Err(GetError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn delete_key_then_get_is_not_found() {
        let (_dir, _mem, cache, transport) = harness();
        transport.serve(LOGO_URL, "\"v1\"", LOGO_BODY);
        cache.fetch(&transport, "logo", LOGO_URL, UpdateMode::Atomic).unwrap();

        cache.delete_key("logo");
        assert!(matches!(cache.get("logo"), Err(GetError::NotFound)));
    }

    #[test]
    fn clear_recreates_empty_layout() {
        let (dir, _mem, cache, transport) = harness();
        transport.serve(LOGO_URL, "\"v1\"", LOGO_BODY);
        cache.fetch(&transport, "logo", LOGO_URL, UpdateMode::Atomic).unwrap();

        cache.clear().unwrap();
        assert!(matches!(cache.get("logo"), Err(GetError::NotFound)));
        assert!(dir.path().join("cache/assets/p").exists());
        assert!(dir.path().join("cache/assets/f").exists());
    }

    #[test]
    fn missing_resource_maps_to_http_request_failed() {
        let (_dir, _mem, cache, transport) = harness();
        assert_eq!(
            cache.fetch(&transport, "logo", LOGO_URL, UpdateMode::Atomic),
            Err(FetchError::HttpRequestFailed { status: 404 })
        );
    }

    #[test]
    fn transport_failure_maps_to_http_request_failed() {
        let (_dir, _mem, cache, transport) = harness();
        *transport.fail_transport.lock().unwrap() = true;
        assert_eq!(
            cache.fetch(&transport, "logo", LOGO_URL, UpdateMode::Atomic),
            Err(FetchError::HttpRequestFailed { status: 0 })
        );
    }

    #[test]
    fn unsupported_stored_version_fails_before_any_request() {
        let (dir, _mem, cache, transport) = harness();
        let path = dir.path().join("cache/assets/f/logo");
        let mut header = CacheFileHeader {
            version: 9,
            file_type: FILE_TYPE_HTTP,
            etag_length: 0,
            content_length: 4,
        }
        .to_bytes()
        .to_vec();
        header.extend_from_slice(b"body");
        std::fs::write(path, header).unwrap();

        assert_eq!(
            cache.fetch(&transport, "logo", LOGO_URL, UpdateMode::Atomic),
            Err(FetchError::InvalidVersion)
        );
    }

    #[test]
    fn get_validates_stored_header_type() {
        let (dir, _mem, cache, _transport) = harness();
        let path = dir.path().join("cache/assets/f/blob");
        let mut raw = CacheFileHeader {
            version: CACHE_FILE_VERSION,
            file_type: 7,
            etag_length: 0,
            content_length: 1,
        }
        .to_bytes()
        .to_vec();
        raw.push(b'x');
        std::fs::write(path, raw).unwrap();

        assert!(matches!(cache.get("blob"), Err(GetError::InvalidHeader)));
    }

    #[test]
    fn missing_content_length_fails_the_fetch() {
        struct NoLengthTransport;
        impl FetchTransport for NoLengthTransport {
            fn fetch(
                &self,
                _heap: &SharedHeap,
                _url: &str,
                _request_headers: &[String],
                handler: &mut dyn FetchHandler,
            ) {
                handler.on_header(b"HTTP/1.1 200 OK\r\n");
                handler.on_header(b"ETag: \"v1\"\r\n");
                if handler.on_body(b"data with no declared length") {
                    handler.on_body(b"more");
                }
                handler.on_complete(TransportResult::Ok, 200);
            }
        }

        let (_dir, _mem, cache, _unused) = harness();
        assert_eq!(
            cache.fetch(&NoLengthTransport, "logo", LOGO_URL, UpdateMode::Atomic),
            Err(FetchError::InvalidContentLength)
        );
    }

    #[test]
    fn heap_scratch_is_returned_after_fetches() {
        let (_dir, _mem, cache, transport) = harness();
        transport.serve(LOGO_URL, "\"v1\"", LOGO_BODY);
        cache.fetch(&transport, "logo", LOGO_URL, UpdateMode::Atomic).unwrap();
        cache.fetch(&transport, "logo", LOGO_URL, UpdateMode::Atomic).unwrap();
        assert_eq!(cache.heap.metrics().num_used_blocks, 0);
    }
}
