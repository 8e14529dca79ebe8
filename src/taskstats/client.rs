//! The generic netlink session and the per-task accounting client.

use super::codec::{self, DecodeError, NlMessage, NLMSG_DONE, NLMSG_ERROR, TASKSTATS_GENL_NAME};
use super::{AccountingSource, PollOutcome, TaskstatsError};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, trace};

const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// What came back for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Generic netlink payload of the matching reply.
    Payload(Vec<u8>),
    /// Positive errno from an `NLMSG_ERROR` reply.
    Error(i32),
    /// Nothing arrived within the receive timeout.
    TimedOut,
}

/// Maps one taskstats reply onto the outcome seen by a task counter.
pub fn classify_reply(reply: Reply) -> Result<PollOutcome, TaskstatsError> {
    match reply {
        Reply::TimedOut => Ok(PollOutcome::NoData),
        Reply::Error(errno) if errno == libc::ESRCH => Ok(PollOutcome::Gone),
        Reply::Error(errno) => Err(TaskstatsError::Netlink(errno)),
        Reply::Payload(payload) => match codec::decode_taskstats_reply(&payload) {
            Ok(record) => Ok(PollOutcome::Record(record)),
            Err(e) if e.is_no_data() => {
                trace!(reason = %e, "Taskstats reply carried no usable record.");
                Ok(PollOutcome::NoData)
            }
            Err(DecodeError::UnsupportedVersion(v)) => Err(TaskstatsError::UnsupportedVersion(v)),
            Err(e) => Err(TaskstatsError::Malformed(e.to_string())),
        },
    }
}

struct Socket {
    fd: OwnedFd,
    seq: u32,
    buf: Vec<u8>,
}

impl Socket {
    fn open(receive_timeout: Duration) -> io::Result<Self> {
        // SAFETY: plain syscall; the returned descriptor is owned below.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: addr outlives the call and the length matches its type.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let tv = libc::timeval {
            tv_sec: receive_timeout.as_secs() as libc::time_t,
            tv_usec: receive_timeout.subsec_micros() as libc::suseconds_t,
        };
        // SAFETY: tv outlives the call and the length matches its type.
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd,
            seq: 0,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send(&self, request: &[u8]) -> io::Result<()> {
        // SAFETY: request is a valid slice for the duration of the call.
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                request.as_ptr() as *const libc::c_void,
                request.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Sends `request` and waits for the reply carrying the same sequence
    /// number. Replies to earlier, timed-out requests are discarded.
    fn roundtrip(&mut self, request: &[u8], seq: u32) -> Result<Reply, TaskstatsError> {
        self.send(request)?;
        loop {
            // SAFETY: buf is a valid, exclusively borrowed buffer of buf.len() bytes.
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                    0,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                        debug!(seq, "Netlink receive timed out.");
                        return Ok(Reply::TimedOut);
                    }
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                }
            }

            let messages = codec::parse_messages(&self.buf[..n as usize])
                .map_err(|e| TaskstatsError::Malformed(e.to_string()))?;
            if let Some(reply) = select_reply(&messages, seq)? {
                return Ok(reply);
            }
        }
    }
}

/// Picks the reply to request `seq` out of one received batch.
///
/// Messages answering earlier requests are skipped. An acknowledgement
/// (`NLMSG_ERROR` with code 0) or `NLMSG_DONE` carries no answer, so `None`
/// means "keep reading".
pub fn select_reply(messages: &[NlMessage<'_>], seq: u32) -> Result<Option<Reply>, TaskstatsError> {
    for message in messages {
        if message.seq != seq {
            trace!(expected = seq, got = message.seq, "Skipping stale netlink reply.");
            continue;
        }
        match message.msg_type {
            NLMSG_ERROR => {
                let code = codec::decode_error_code(message.payload)
                    .map_err(|e| TaskstatsError::Malformed(e.to_string()))?;
                if code != 0 {
                    // The kernel sends the negated errno.
                    return Ok(Some(Reply::Error(-code)));
                }
            }
            NLMSG_DONE => {}
            _ => return Ok(Some(Reply::Payload(message.payload.to_vec()))),
        }
    }
    Ok(None)
}

/// The one netlink connection shared by every task counter.
///
/// Exchanges are serialized: a request is only sent once the previous one
/// has been answered or has timed out.
pub struct NetlinkSession {
    socket: Mutex<Socket>,
    family_id: u16,
}

impl std::fmt::Debug for NetlinkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetlinkSession")
            .field("family_id", &self.family_id)
            .finish_non_exhaustive()
    }
}

impl NetlinkSession {
    /// Opens the socket and resolves the `TASKSTATS` family id.
    pub fn open(receive_timeout: Duration) -> Result<Self, TaskstatsError> {
        let mut socket = Socket::open(receive_timeout)?;
        let seq = socket.next_seq();
        let request = codec::encode_family_request(seq, TASKSTATS_GENL_NAME);
        let family_id = match socket.roundtrip(&request, seq)? {
            Reply::Payload(payload) => codec::decode_family_id(&payload)
                .map_err(|e| TaskstatsError::Malformed(e.to_string()))?,
            Reply::Error(errno) if errno == libc::ENOENT => {
                return Err(TaskstatsError::FamilyNotFound(TASKSTATS_GENL_NAME.to_string()))
            }
            Reply::Error(errno) => return Err(TaskstatsError::Netlink(errno)),
            Reply::TimedOut => return Err(io::Error::from(io::ErrorKind::TimedOut).into()),
        };
        info!(family_id, "Resolved taskstats generic netlink family.");
        Ok(Self {
            socket: Mutex::new(socket),
            family_id,
        })
    }

    pub fn family_id(&self) -> u16 {
        self.family_id
    }
}

impl AccountingSource for NetlinkSession {
    fn fetch(&self, tid: u32) -> Result<PollOutcome, TaskstatsError> {
        let mut socket = self
            .socket
            .lock()
            .map_err(|_| TaskstatsError::Malformed("netlink session lock poisoned".into()))?;
        let seq = socket.next_seq();
        let request = codec::encode_taskstats_request(self.family_id, seq, tid);
        let reply = socket.roundtrip(&request, seq)?;
        classify_reply(reply)
    }
}

/// Accounting client bound to one thread id.
#[derive(Clone)]
pub struct TaskAccountingClient {
    tid: u32,
    source: Arc<dyn AccountingSource>,
}

impl std::fmt::Debug for TaskAccountingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskAccountingClient")
            .field("tid", &self.tid)
            .finish_non_exhaustive()
    }
}

impl TaskAccountingClient {
    pub fn new(tid: u32, source: Arc<dyn AccountingSource>) -> Self {
        Self { tid, source }
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Requests the current cumulative record for this task.
    pub fn poll(&self) -> Result<PollOutcome, TaskstatsError> {
        self.source.fetch(self.tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskstats::codec::fixtures::{nl_message, stats_blob, taskstats_reply_payload};
    use crate::taskstats::codec::parse_messages;
    use crate::taskstats::AccountingRecord;

    const FAMILY: u16 = 0x1c;

    fn select(buf: &[u8], seq: u32) -> Option<Reply> {
        select_reply(&parse_messages(buf).unwrap(), seq).unwrap()
    }

    #[test]
    fn test_stale_reply_is_skipped_for_the_matching_one() {
        let stale = AccountingRecord {
            read_bytes: 1,
            ..Default::default()
        };
        let current = AccountingRecord {
            read_bytes: 2,
            ..Default::default()
        };
        let stale_payload = taskstats_reply_payload(5, &stats_blob(9, &stale, 328));
        let current_payload = taskstats_reply_payload(5, &stats_blob(9, &current, 328));
        let mut buf = nl_message(FAMILY, 6, &stale_payload);
        buf.extend(nl_message(FAMILY, 7, &current_payload));

        let reply = select(&buf, 7).unwrap();
        assert_eq!(reply, Reply::Payload(current_payload));
        assert_eq!(classify_reply(reply).unwrap(), PollOutcome::Record(current));

        assert_eq!(select(&nl_message(FAMILY, 6, &stale_payload), 7), None);
    }

    #[test]
    fn test_error_reply_carries_positive_errno() {
        let buf = nl_message(NLMSG_ERROR, 3, &(-libc::ESRCH).to_ne_bytes());
        let reply = select(&buf, 3).unwrap();
        assert_eq!(reply, Reply::Error(libc::ESRCH));
        assert_eq!(classify_reply(reply).unwrap(), PollOutcome::Gone);
    }

    #[test]
    fn test_ack_and_done_mean_keep_reading() {
        assert_eq!(select(&nl_message(NLMSG_ERROR, 3, &0i32.to_ne_bytes()), 3), None);
        assert_eq!(select(&nl_message(NLMSG_DONE, 3, &[]), 3), None);
    }

    #[test]
    fn test_truncated_error_payload_is_malformed() {
        let buf = nl_message(NLMSG_ERROR, 3, &[0, 0]);
        assert!(matches!(
            select_reply(&parse_messages(&buf).unwrap(), 3),
            Err(TaskstatsError::Malformed(_))
        ));
    }

    #[test]
    fn test_esrch_means_gone() {
        assert_eq!(
            classify_reply(Reply::Error(libc::ESRCH)).unwrap(),
            PollOutcome::Gone
        );
    }

    #[test]
    fn test_timeout_means_no_data() {
        assert_eq!(classify_reply(Reply::TimedOut).unwrap(), PollOutcome::NoData);
    }

    #[test]
    fn test_other_errno_is_fatal() {
        assert!(matches!(
            classify_reply(Reply::Error(libc::EPERM)),
            Err(TaskstatsError::Netlink(e)) if e == libc::EPERM
        ));
    }

    #[test]
    fn test_payload_decodes_or_reports_no_data() {
        let record = AccountingRecord {
            read_bytes: 100,
            ..Default::default()
        };
        let good = taskstats_reply_payload(5, &stats_blob(9, &record, 328));
        assert_eq!(
            classify_reply(Reply::Payload(good)).unwrap(),
            PollOutcome::Record(record)
        );

        let short = taskstats_reply_payload(5, &stats_blob(9, &record, 100));
        assert_eq!(classify_reply(Reply::Payload(short)).unwrap(), PollOutcome::NoData);

        let old = taskstats_reply_payload(5, &stats_blob(3, &record, 328));
        assert!(matches!(
            classify_reply(Reply::Payload(old)),
            Err(TaskstatsError::UnsupportedVersion(3))
        ));
    }
}
