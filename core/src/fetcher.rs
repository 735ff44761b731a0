use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::net::{FetchRequest, SegmentTransport};
use crate::retry::RetryPolicy;
use crate::segment::{Segment, SegmentStatus};
use crate::state::SharedState;
use crate::throttle::Throttle;

/// Downloads single segments into a file at a given offset, with retries.
#[derive(Clone)]
pub struct SegmentFetcher {
    transport: Arc<dyn SegmentTransport>,
    state: Arc<SharedState>,
    throttle: Arc<Throttle>,
    retry: RetryPolicy,
    max_attempts: u32,
    buffer_size: usize,
}

impl SegmentFetcher {
    pub fn new(
        config: &EngineConfig,
        transport: Arc<dyn SegmentTransport>,
        state: Arc<SharedState>,
        throttle: Arc<Throttle>,
    ) -> Self {
        Self {
            transport,
            state,
            throttle,
            retry: RetryPolicy::from_config(config),
            max_attempts: config.max_attempts(),
            buffer_size: config.buffer_size.max(1024),
        }
    }

    pub fn fetch(
        &self,
        worker: usize,
        segment: &Segment,
        file: &mut File,
        offset: u64,
    ) -> CoreResult<u64> {
        segment.set_status(SegmentStatus::Active);
        let mut last_error = None;
        for attempt in 0..self.max_attempts {
            if attempt > 0 && !self.retry.wait(attempt, worker, segment.index, &self.state) {
                return Err(CoreError::Canceled);
            }
            if self.state.is_stopped() {
                return Err(CoreError::Canceled);
            }
            self.state.restart_segment(segment.index);
            match self.attempt(segment, file, offset) {
                Ok(written) => {
                    segment.set_status(SegmentStatus::Completed);
                    return Ok(written);
                }
                Err(CoreError::Canceled) => return Err(CoreError::Canceled),
                Err(err) if !err.is_transient() => {
                    segment.set_status(SegmentStatus::Failed);
                    return Err(err);
                }
                Err(err) => {
                    if attempt + 1 < self.max_attempts {
                        self.state.report_transient(segment.index, attempt + 1, &err);
                    }
                    last_error = Some(err);
                }
            }
        }
        self.state.restart_segment(segment.index);
        segment.set_status(SegmentStatus::Failed);
        let cause = last_error.unwrap_or_else(|| {
            CoreError::Network(format!("segment {} was never attempted", segment.index))
        });
        Err(CoreError::LastAttemptFailed {
            index: segment.index,
            attempts: self.max_attempts,
            cause: Box::new(cause),
        })
    }

    fn attempt(&self, segment: &Segment, file: &mut File, offset: u64) -> CoreResult<u64> {
        let mut response = self.transport.get(&FetchRequest::for_segment(segment))?;
        if !response.is_success() {
            return Err(CoreError::Rejected {
                index: segment.index,
                status: response.status,
            });
        }

        // A declared size (or range) wins over whatever the response claims.
        let declared = segment.expected_size();
        let true_size = declared.or(response.content_length);

        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;

        let slice = self.retry.slice();
        let mut buffer = vec![0u8; self.buffer_size];
        let mut received = 0u64;
        loop {
            if self.state.is_paused() && !self.state.hold_while_paused(slice) {
                return Err(CoreError::Canceled);
            }
            if self.state.is_stopped() {
                return Err(CoreError::Canceled);
            }
            let read = response
                .body
                .read(&mut buffer)
                .map_err(|err| CoreError::Network(err.to_string()))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])?;
            received += read as u64;
            self.state.add_bytes(segment.index, read as u64);
            self.throttle.throttle(read as u64, &self.state, slice);
        }
        file.flush()?;
        trace!(segment = segment.index, received, "segment body received");

        if let Some(expected) = true_size {
            if received != expected {
                return Err(CoreError::SizeMismatch {
                    index: segment.index,
                    expected,
                    actual: received,
                });
            }
        }
        if declared.is_none() {
            debug!(segment = segment.index, received, "segment size resolved");
            let previous = segment.set_expected_size(received);
            self.state.resolve_size(previous, received);
        }
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::FetchResponse;
    use crate::progress::silent;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    struct Scripted {
        // One entry per call: Ok((status, body, content_length)) or an error.
        replies: Mutex<Vec<CoreResult<(u16, Vec<u8>, Option<u64>)>>>,
    }

    impl SegmentTransport for Scripted {
        fn get(&self, _req: &FetchRequest) -> CoreResult<FetchResponse> {
            let mut replies = self.replies.lock().unwrap();
            let reply = if replies.is_empty() {
                Err(CoreError::Network("script exhausted".to_string()))
            } else {
                replies.remove(0)
            };
            let (status, body, content_length) = reply?;
            Ok(FetchResponse {
                status,
                content_length,
                body: Box::new(Cursor::new(body)),
            })
        }
    }

    fn fetcher(
        replies: Vec<CoreResult<(u16, Vec<u8>, Option<u64>)>>,
        segments: &[Segment],
    ) -> (SegmentFetcher, Arc<SharedState>) {
        let config = EngineConfig {
            base_delay_ms: 1,
            retry_slice_ms: 1,
            ..EngineConfig::default()
        };
        fetcher_with(config, replies, segments)
    }

    fn fetcher_with(
        config: EngineConfig,
        replies: Vec<CoreResult<(u16, Vec<u8>, Option<u64>)>>,
        segments: &[Segment],
    ) -> (SegmentFetcher, Arc<SharedState>) {
        let state = Arc::new(SharedState::new(segments, 1, silent()));
        let transport = Arc::new(Scripted {
            replies: Mutex::new(replies),
        });
        let fetcher = SegmentFetcher::new(&config, transport, Arc::clone(&state), Arc::new(Throttle::unlimited()));
        (fetcher, state)
    }

    fn read_all(file: &mut File) -> Vec<u8> {
        let mut out = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn writes_at_offset() {
        let segments = vec![Segment::new(0, "mem://a", Some(3))];
        let (fetcher, state) = fetcher(vec![Ok((200, b"abc".to_vec(), Some(3)))], &segments);
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"xy").unwrap();
        let written = fetcher.fetch(0, &segments[0], &mut file, 2).unwrap();
        assert_eq!(written, 3);
        assert_eq!(read_all(&mut file), b"xyabc");
        assert_eq!(state.downloaded(), 3);
        assert_eq!(segments[0].status(), SegmentStatus::Completed);
    }

    #[test]
    fn short_read_is_retried() {
        let segments = vec![Segment::new(0, "mem://a", Some(4))];
        let (fetcher, state) = fetcher(
            vec![
                Ok((200, b"ab".to_vec(), None)),
                Ok((200, b"abcd".to_vec(), None)),
            ],
            &segments,
        );
        let mut file = tempfile::tempfile().unwrap();
        assert_eq!(fetcher.fetch(0, &segments[0], &mut file, 0).unwrap(), 4);
        assert_eq!(read_all(&mut file), b"abcd");
        assert_eq!(state.downloaded(), 4);
        assert_eq!(state.retries(), 1);
        assert!(!state.has_error());
    }

    #[test]
    fn unknown_size_learned_from_body() {
        let segments = vec![Segment::new(0, "mem://a", None)];
        let (fetcher, state) = fetcher(vec![Ok((200, b"hello".to_vec(), None))], &segments);
        let mut file = tempfile::tempfile().unwrap();
        fetcher.fetch(0, &segments[0], &mut file, 0).unwrap();
        assert_eq!(segments[0].expected_size(), Some(5));
        assert_eq!(state.total_size(), Some(5));
    }

    #[test]
    fn exhausted_attempts_are_fatal() {
        let segments = vec![Segment::new(0, "mem://a", Some(1))];
        let (fetcher, state) = fetcher(
            vec![
                Ok((503, Vec::new(), None)),
                Err(CoreError::Network("reset".to_string())),
                Ok((404, Vec::new(), None)),
            ],
            &segments,
        );
        let mut file = tempfile::tempfile().unwrap();
        match fetcher.fetch(0, &segments[0], &mut file, 0) {
            Err(CoreError::LastAttemptFailed { index, attempts, cause }) => {
                assert_eq!(index, 0);
                assert_eq!(attempts, 3);
                assert!(matches!(*cause, CoreError::Rejected { status: 404, .. }));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(state.retries(), 2);
        assert!(!state.has_error());
        assert_eq!(segments[0].status(), SegmentStatus::Failed);
    }

    #[test]
    fn stopped_session_cancels_fetch() {
        let segments = vec![Segment::new(0, "mem://a", Some(1))];
        let (fetcher, state) = fetcher(vec![Ok((200, b"a".to_vec(), None))], &segments);
        state.cancel();
        let mut file = tempfile::tempfile().unwrap();
        assert!(matches!(
            fetcher.fetch(0, &segments[0], &mut file, 0),
            Err(CoreError::Canceled)
        ));
    }

    #[test]
    fn declared_size_beats_content_length() {
        let segments = vec![Segment::new(0, "mem://a", Some(4))];
        let (fetcher, state) = fetcher(
            vec![
                Ok((200, b"abcdef".to_vec(), Some(6))),
                Ok((200, b"abcdef".to_vec(), Some(6))),
                Ok((200, b"abcdef".to_vec(), Some(6))),
            ],
            &segments,
        );
        let mut file = tempfile::tempfile().unwrap();
        match fetcher.fetch(0, &segments[0], &mut file, 0) {
            Err(CoreError::LastAttemptFailed { cause, .. }) => assert!(matches!(
                *cause,
                CoreError::SizeMismatch {
                    expected: 4,
                    actual: 6,
                    ..
                }
            )),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(segments[0].expected_size(), Some(4));
        assert_eq!(state.total_size(), Some(4));
        assert_eq!(state.downloaded(), 0);
    }

    #[test]
    fn oversized_body_retried_until_it_matches() {
        let segments = vec![Segment::new(0, "mem://a", Some(4))];
        let (fetcher, state) = fetcher(
            vec![
                Ok((200, b"abcdef".to_vec(), Some(6))),
                Ok((200, b"abcd".to_vec(), Some(4))),
            ],
            &segments,
        );
        let mut file = tempfile::tempfile().unwrap();
        assert_eq!(fetcher.fetch(0, &segments[0], &mut file, 0).unwrap(), 4);
        assert_eq!(read_all(&mut file), b"abcd");
        assert_eq!(state.retries(), 1);
        assert_eq!(state.total_size(), Some(4));
    }

    #[test]
    fn pause_hold_follows_configured_slice() {
        let config = EngineConfig {
            retry_slice_ms: 5,
            ..EngineConfig::default()
        };
        let segments = vec![Segment::new(0, "mem://a", Some(3))];
        let (fetcher, state) = fetcher_with(config, vec![Ok((200, b"abc".to_vec(), Some(3)))], &segments);
        assert_eq!(fetcher.retry.slice(), Duration::from_millis(5));

        state.pause();
        let canceler = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                state.cancel();
            })
        };
        let started = Instant::now();
        let mut file = tempfile::tempfile().unwrap();
        assert!(matches!(
            fetcher.fetch(0, &segments[0], &mut file, 0),
            Err(CoreError::Canceled)
        ));
        canceler.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(state.downloaded(), 0);
    }
}
