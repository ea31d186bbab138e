use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use reqwest::{
    blocking::{Client, Response},
    header::{CONTENT_RANGE, RANGE},
    StatusCode,
};

use crate::{core::cancel::CancellationToken, error::PipelineError};

use super::{wrap_source_error, ByteSource};

/// Where the standard Wikidata entity dump lives.
pub const DEFAULT_DUMP_URL: &str =
    "https://dumps.wikimedia.org/wikidatawiki/entities/latest-all.json.bz2";

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);
/// A body read that stalls longer than this returns an error, which either
/// triggers a reconnect or lets a cancellation request take effect.
const READ_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Source backed by an HTTP(S) download.
///
/// The response body is streamed straight into the pipeline while being
/// teed to a deterministic `<name>.part` file next to the target directory,
/// so an interrupted run leaves bytes a later run can resume from with a
/// `Range` request. Only transient network failures are retried; anything
/// structural (bad status, non-contiguous range) is fatal immediately.
pub struct DownloadSource {
    url: String,
    part_path: PathBuf,
    resume: bool,
    max_retries: u32,
    backoff: Duration,
    cancel: CancellationToken,
}

impl DownloadSource {
    pub fn builder(url: impl Into<String>) -> DownloadSourceBuilder {
        DownloadSourceBuilder::new(url)
    }

    /// The deterministic path partial downloads persist to.
    pub fn part_path(&self) -> &Path {
        &self.part_path
    }
}

impl ByteSource for DownloadSource {
    fn open(&self) -> Result<Box<dyn Read + Send>, PipelineError> {
        let existing = if self.resume {
            match std::fs::metadata(&self.part_path) {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            }
        } else {
            // stale partial bytes must not leak into a fresh download
            let _ = std::fs::remove_file(&self.part_path);
            0
        };

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            // the body is multi-gigabyte, so a whole-request timeout cannot
            // apply; the blocking client's timeout is per read/write
            // operation, bounding how long a stalled server can hold up the
            // stream (and a cancellation request)
            .timeout(READ_STALL_TIMEOUT)
            .build()
            .map_err(|err| PipelineError::SourceUnavailable(err.to_string()))?;

        let response = request_at(
            &client,
            &self.url,
            existing,
            self.max_retries,
            self.backoff,
            &self.cancel,
        )?;

        let replay = if existing > 0 {
            info!(
                "resuming download of {} at byte {} from {}",
                self.url,
                existing,
                self.part_path.display()
            );
            let file = File::open(&self.part_path).map_err(|err| {
                PipelineError::SourceUnavailable(format!(
                    "{}: {}",
                    self.part_path.display(),
                    err
                ))
            })?;
            Some(file.take(existing))
        } else {
            info!("downloading {} to {}", self.url, self.part_path.display());
            None
        };

        let appender = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.part_path)
            .map_err(|err| {
                PipelineError::SourceUnavailable(format!(
                    "{}: {}",
                    self.part_path.display(),
                    err
                ))
            })?;

        Ok(Box::new(DownloadReader {
            client,
            url: self.url.clone(),
            response,
            replay,
            appender,
            offset: existing,
            retries_left: self.max_retries,
            backoff: self.backoff,
            cancel: self.cancel.clone(),
        }))
    }
}

/// Builder for [`DownloadSource`].
pub struct DownloadSourceBuilder {
    url: String,
    target_dir: PathBuf,
    resume: bool,
    max_retries: u32,
    backoff: Duration,
    cancel: CancellationToken,
}

impl DownloadSourceBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            target_dir: PathBuf::from("."),
            resume: false,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
            cancel: CancellationToken::new(),
        }
    }

    /// Directory the `.part` file is written to.
    pub fn target_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.target_dir = dir.into();
        self
    }

    /// Resume from an existing `.part` file instead of starting over.
    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Token the reader polls between chunk reads and during retry waits;
    /// once cancelled, the next read ends the download immediately.
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> DownloadSource {
        let name = remote_file_name(&self.url);
        let part_path = self.target_dir.join(format!("{name}.part"));
        DownloadSource {
            url: self.url,
            part_path,
            resume: self.resume,
            max_retries: self.max_retries,
            backoff: self.backoff,
            cancel: self.cancel,
        }
    }
}

/// Streaming reader over the response body: replays any previously
/// persisted bytes first, then tees fresh network bytes into the part file.
/// A mid-stream connection cut is retried by reconnecting with a `Range`
/// request at the current offset, within the retry budget.
struct DownloadReader {
    client: Client,
    url: String,
    response: Response,
    replay: Option<io::Take<File>>,
    appender: File,
    offset: u64,
    retries_left: u32,
    backoff: Duration,
    cancel: CancellationToken,
}

impl Read for DownloadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(wrap_source_error(PipelineError::SourceUnavailable(
                format!("download of {} cancelled at byte {}", self.url, self.offset),
            )));
        }

        if let Some(replay) = self.replay.as_mut() {
            let n = replay.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.replay = None;
        }

        loop {
            if self.cancel.is_cancelled() {
                return Err(wrap_source_error(PipelineError::SourceUnavailable(
                    format!("download of {} cancelled at byte {}", self.url, self.offset),
                )));
            }
            match self.response.read(buf) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    self.appender.write_all(&buf[..n]).map_err(|err| {
                        wrap_source_error(PipelineError::SourceUnavailable(format!(
                            "failed to persist partial download: {err}"
                        )))
                    })?;
                    self.offset += n as u64;
                    return Ok(n);
                }
                Err(err) if self.retries_left > 0 => {
                    self.retries_left -= 1;
                    warn!(
                        "download interrupted at byte {} ({}), reconnecting ({} retries left)",
                        self.offset, err, self.retries_left
                    );
                    sleep_unless_cancelled(self.backoff, &self.cancel);
                    self.backoff *= 2;
                    if self.cancel.is_cancelled() {
                        continue;
                    }
                    match request_at(
                        &self.client,
                        &self.url,
                        self.offset,
                        0,
                        self.backoff,
                        &self.cancel,
                    ) {
                        Ok(response) => self.response = response,
                        Err(err) => return Err(wrap_source_error(err)),
                    }
                }
                Err(err) => {
                    return Err(wrap_source_error(PipelineError::SourceUnavailable(
                        format!("download of {} failed at byte {}: {}", self.url, self.offset, err),
                    )))
                }
            }
        }
    }
}

/// Issues the GET, with a `Range` header when `offset` is non-zero, and
/// verifies the server honored it: a 206 whose `Content-Range` starts
/// exactly at `offset`. Appending a non-contiguous range would corrupt the
/// part file, so a mismatch is fatal rather than silently restarted.
fn request_at(
    client: &Client,
    url: &str,
    offset: u64,
    max_retries: u32,
    mut backoff: Duration,
    cancel: &CancellationToken,
) -> Result<Response, PipelineError> {
    let mut attempt = 0;
    let response = loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::SourceUnavailable(format!(
                "download of {url} cancelled"
            )));
        }
        let mut request = client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        match request.send() {
            Ok(response) => break response,
            Err(err) if attempt < max_retries && (err.is_timeout() || err.is_connect()) => {
                attempt += 1;
                warn!(
                    "transient error fetching {url} ({err}), retry {attempt}/{max_retries} in {backoff:?}"
                );
                sleep_unless_cancelled(backoff, cancel);
                backoff *= 2;
            }
            Err(err) => {
                return Err(PipelineError::SourceUnavailable(format!(
                    "GET {url} failed: {err}"
                )))
            }
        }
    };

    if offset == 0 {
        if !response.status().is_success() {
            return Err(PipelineError::SourceUnavailable(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        return Ok(response);
    }

    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(PipelineError::SourceUnavailable(format!(
            "{url} does not support resume: expected 206, got {}",
            response.status()
        )));
    }

    let start = response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_content_range_start);

    match start {
        Some(start) if start == offset => {
            debug!("server confirmed range resume at byte {offset}");
            Ok(response)
        }
        Some(start) => Err(PipelineError::SourceUnavailable(format!(
            "{url} resumed at byte {start}, expected {offset}; refusing non-contiguous append"
        ))),
        None => Err(PipelineError::SourceUnavailable(format!(
            "{url} sent 206 without a parsable Content-Range"
        ))),
    }
}

/// Sleeps in short slices so a cancellation request cuts a retry wait
/// short instead of sitting out the whole (exponentially growing) backoff.
fn sleep_unless_cancelled(total: Duration, cancel: &CancellationToken) {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while !cancel.is_cancelled() && !remaining.is_zero() {
        let nap = remaining.min(slice);
        thread::sleep(nap);
        remaining = remaining.saturating_sub(nap);
    }
}

/// Extracts the start offset from a `Content-Range: bytes N-M/T` header.
fn parse_content_range_start(value: &str) -> Option<u64> {
    value
        .trim()
        .strip_prefix("bytes ")?
        .split('-')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Last path segment of the URL, used to derive the part-file name.
fn remote_file_name(url: &str) -> &str {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .unwrap_or("download")
}

#[cfg(test)]
mod tests {
    use super::{parse_content_range_start, remote_file_name, DownloadSource};

    #[test]
    fn content_range_start_is_parsed() {
        assert_eq!(
            parse_content_range_start("bytes 100-1023/1024"),
            Some(100)
        );
        assert_eq!(parse_content_range_start("bytes 0-0/1"), Some(0));
        assert_eq!(parse_content_range_start("bytes 5-9/*"), Some(5));
        assert_eq!(parse_content_range_start("items 5-9/10"), None);
        assert_eq!(parse_content_range_start("bytes */1024"), None);
        assert_eq!(parse_content_range_start(""), None);
    }

    #[test]
    fn part_path_is_deterministic() {
        let source = DownloadSource::builder(
            "https://dumps.wikimedia.org/wikidatawiki/entities/latest-all.json.bz2",
        )
        .target_dir("/tmp/dumps")
        .build();
        assert_eq!(
            source.part_path().to_str().unwrap(),
            "/tmp/dumps/latest-all.json.bz2.part"
        );
    }

    #[test]
    fn file_name_falls_back_for_bare_hosts() {
        assert_eq!(remote_file_name("https://example.org/a/b.bz2"), "b.bz2");
        assert_eq!(remote_file_name("https://"), "download");
    }
}
