//! Durable persistence: an append-only record log written by a background
//! writer task, with a written-record upcall that feeds `persisted_num`
//! back into the table, plus the persisted view file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use crate::utils::SquallError;
use crate::view::View;
use crate::NodeId;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Magic number framing every persisted record.
const RECORD_MAGIC: u32 = 0x53_51_4C_52; // "SQLR"

/// Magic number heading the persisted view file.
const VIEW_FILE_MAGIC: u32 = 0x53_51_56_57; // "SQVW"

/// One delivered message bound for the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    /// View in which the message was delivered.
    pub vid: u32,

    /// Subgroup the message belongs to.
    pub subgroup: u32,

    /// Sender's node ID.
    pub sender: NodeId,

    /// Sender's per-subgroup message index.
    pub index: u64,

    /// Cooked (RPC-bound) send flag.
    pub cooked: bool,

    /// Payload bytes (header stripped).
    pub data: Vec<u8>,
}

/// Serializes one record with magic framing and a trailing CRC:
/// `{magic:32, vid:32, subgroup:32, sender:32, index:64, size:32,
/// cooked:8, bytes[size], crc:32}`, all fixed-width fields big-endian.
pub(crate) fn encode_record(record: &PersistedRecord) -> Vec<u8> {
    let mut framed =
        Vec::with_capacity(4 + 4 + 4 + 4 + 8 + 4 + 1 + record.data.len() + 4);
    framed.extend_from_slice(&RECORD_MAGIC.to_be_bytes());
    framed.extend_from_slice(&record.vid.to_be_bytes());
    framed.extend_from_slice(&record.subgroup.to_be_bytes());
    framed.extend_from_slice(&record.sender.to_be_bytes());
    framed.extend_from_slice(&record.index.to_be_bytes());
    framed.extend_from_slice(&(record.data.len() as u32).to_be_bytes());
    framed.push(record.cooked as u8);
    framed.extend_from_slice(&record.data);
    let crc = crc32fast::hash(&framed[4..]);
    framed.extend_from_slice(&crc.to_be_bytes());
    framed
}

/// Parses the record starting at `offset`. Returns the record and the
/// offset one past it, or `None` at a clean end of log.
pub(crate) fn decode_record(
    bytes: &[u8],
    offset: usize,
) -> Result<Option<(PersistedRecord, usize)>, SquallError> {
    if offset == bytes.len() {
        return Ok(None);
    }
    let header_end = offset + 4 + 4 + 4 + 4 + 8 + 4 + 1;
    if header_end > bytes.len() {
        return Err(SquallError("truncated record header".into()));
    }
    let field =
        |beg: usize, len: usize| &bytes[offset + beg..offset + beg + len];

    let magic = u32::from_be_bytes(field(0, 4).try_into().unwrap());
    if magic != RECORD_MAGIC {
        return Err(SquallError(format!(
            "bad record magic {:#x} at offset {}",
            magic, offset
        )));
    }
    let vid = u32::from_be_bytes(field(4, 4).try_into().unwrap());
    let subgroup = u32::from_be_bytes(field(8, 4).try_into().unwrap());
    let sender = u32::from_be_bytes(field(12, 4).try_into().unwrap());
    let index = u64::from_be_bytes(field(16, 8).try_into().unwrap());
    let size =
        u32::from_be_bytes(field(24, 4).try_into().unwrap()) as usize;
    let cooked = bytes[offset + 28] != 0;

    let data_end = header_end + size;
    let record_end = data_end + 4;
    if record_end > bytes.len() {
        return Err(SquallError("truncated record payload".into()));
    }
    let data = bytes[header_end..data_end].to_vec();
    let stored_crc =
        u32::from_be_bytes(bytes[data_end..record_end].try_into().unwrap());
    let actual_crc = crc32fast::hash(&bytes[offset + 4..data_end]);
    if stored_crc != actual_crc {
        return Err(SquallError(format!(
            "record crc mismatch at offset {}",
            offset
        )));
    }

    Ok(Some((
        PersistedRecord {
            vid,
            subgroup,
            sender,
            index,
            cooked,
            data,
        },
        record_end,
    )))
}

/// Upcall fired after a record hit stable storage.
pub(crate) type WrittenUpcall =
    Box<dyn Fn(PersistedRecord) + Send + Sync>;

/// Durable message log writer module.
pub(crate) struct PersistHub {
    /// My node ID.
    me: NodeId,

    /// Sender side of the write channel.
    tx_write: mpsc::UnboundedSender<PersistedRecord>,

    /// Upcall invoked by the writer task per fsynced record; swapped on
    /// view transitions.
    written_upcall: Arc<StdMutex<Option<WrittenUpcall>>>,

    /// Path of the backing log file.
    path: PathBuf,

    /// Join handle of the writer task.
    _writer_handle: JoinHandle<()>,
}

impl PersistHub {
    /// Creates the persistence hub and spawns the writer task appending
    /// to the given backing file.
    pub(crate) async fn new_and_setup(
        me: NodeId,
        path: &Path,
    ) -> Result<Self, SquallError> {
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!(me; "created log file '{}'", path.display());
        } else {
            pf_info!(me; "log file '{}' already exists", path.display());
        }
        let backer_file =
            OpenOptions::new().append(true).open(path).await?;

        let (tx_write, rx_write) = mpsc::unbounded_channel();
        let written_upcall: Arc<StdMutex<Option<WrittenUpcall>>> =
            Arc::new(StdMutex::new(None));

        let writer_handle = tokio::spawn(Self::writer_task(
            me,
            backer_file,
            rx_write,
            written_upcall.clone(),
        ));

        Ok(PersistHub {
            me,
            tx_write,
            written_upcall,
            path: path.to_path_buf(),
            _writer_handle: writer_handle,
        })
    }

    /// Path of the backing log file.
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Installs the written-record upcall. Called on every view
    /// transition since the upcall captures per-view state.
    pub(crate) fn set_written_upcall(&self, upcall: WrittenUpcall) {
        *self.written_upcall.lock().unwrap() = Some(upcall);
    }

    /// Submits a delivered message for appending to the log.
    pub(crate) fn write_message(
        &self,
        record: PersistedRecord,
    ) -> Result<(), SquallError> {
        self.tx_write.send(record).map_err(SquallError::msg)
    }

    /// Writer task: appends records with fsync, then fires the upcall.
    async fn writer_task(
        me: NodeId,
        mut backer_file: File,
        mut rx_write: mpsc::UnboundedReceiver<PersistedRecord>,
        written_upcall: Arc<StdMutex<Option<WrittenUpcall>>>,
    ) {
        pf_debug!(me; "persistence writer task spawned");

        while let Some(record) = rx_write.recv().await {
            let framed = encode_record(&record);
            let written: Result<(), SquallError> = async {
                backer_file.write_all(&framed).await?;
                backer_file.sync_data().await?;
                Ok(())
            }
            .await;

            match written {
                Ok(()) => {
                    let upcall = written_upcall.lock().unwrap();
                    if let Some(upcall) = upcall.as_ref() {
                        upcall(record);
                    }
                }
                Err(e) => {
                    // persisted_num stalls; flow control will eventually
                    // block senders
                    pf_error!(me; "error appending record: {}", e);
                }
            }
        }

        pf_debug!(me; "persistence writer task exited");
    }
}

/// Reads back every record of a log file, validating framing and CRCs.
pub(crate) fn replay_log(
    path: &Path,
) -> Result<Vec<PersistedRecord>, SquallError> {
    let bytes = std::fs::read(path)?;
    let mut records = Vec::new();
    let mut offset = 0;
    while let Some((record, next)) = decode_record(&bytes, offset)? {
        records.push(record);
        offset = next;
    }
    Ok(records)
}

/// Atomically replaces the persisted view file: magic, then a
/// length-prefixed serialized view.
pub(crate) fn save_view(
    path: &Path,
    view: &View,
) -> Result<(), SquallError> {
    let body = rmp_serde::encode::to_vec(view)?;
    let mut framed = Vec::with_capacity(4 + 8 + body.len());
    framed.extend_from_slice(&VIEW_FILE_MAGIC.to_be_bytes());
    framed.extend_from_slice(&(body.len() as u64).to_be_bytes());
    framed.extend_from_slice(&body);

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &framed)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Loads the persisted view file written by `save_view`.
pub(crate) fn load_view(path: &Path) -> Result<View, SquallError> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 12 {
        return Err(SquallError("view file too short".into()));
    }
    let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    if magic != VIEW_FILE_MAGIC {
        return Err(SquallError(format!(
            "bad view file magic {:#x}",
            magic
        )));
    }
    let len =
        u64::from_be_bytes(bytes[4..12].try_into().unwrap()) as usize;
    if bytes.len() < 12 + len {
        return Err(SquallError("truncated view file".into()));
    }
    Ok(rmp_serde::decode::from_slice(&bytes[12..12 + len])?)
}

#[cfg(test)]
mod persist_tests {
    use super::*;
    use crate::view::{Mode, SubgroupSpec, MemberAddrs};

    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{self, Duration};

    fn test_record(index: u64) -> PersistedRecord {
        PersistedRecord {
            vid: 2,
            subgroup: 1,
            sender: 30,
            index,
            cooked: false,
            data: vec![0xab; 10],
        }
    }

    #[test]
    fn record_round_trip() -> Result<(), SquallError> {
        let record = test_record(5);
        let framed = encode_record(&record);
        let (back, end) = decode_record(&framed, 0)?.unwrap();
        assert_eq!(back, record);
        assert_eq!(end, framed.len());
        assert_eq!(decode_record(&framed, end)?, None);
        Ok(())
    }

    #[test]
    fn record_crc_detects_corruption() {
        let mut framed = encode_record(&test_record(0));
        let flip = framed.len() / 2;
        framed[flip] ^= 0xff;
        assert!(decode_record(&framed, 0).is_err());
    }

    #[test]
    fn record_bad_magic_rejected() {
        let mut framed = encode_record(&test_record(0));
        framed[0] ^= 0xff;
        assert!(decode_record(&framed, 0).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_then_replay() -> Result<(), SquallError> {
        let path = Path::new("/tmp/test-squall-persist-0.log");
        let _ = std::fs::remove_file(path);

        let written = Arc::new(AtomicUsize::new(0));
        let hub = PersistHub::new_and_setup(0, path).await?;
        let written_ref = written.clone();
        hub.set_written_upcall(Box::new(move |_| {
            written_ref.fetch_add(1, Ordering::SeqCst);
        }));

        for i in 0..3 {
            hub.write_message(test_record(i))?;
        }
        while written.load(Ordering::SeqCst) < 3 {
            time::sleep(Duration::from_millis(10)).await;
        }

        let records = replay_log(path)?;
        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record, &test_record(i as u64));
        }
        Ok(())
    }

    #[test]
    fn view_file_round_trip() -> Result<(), SquallError> {
        let path = Path::new("/tmp/test-squall-view-0.state");
        let view = View::new(
            4,
            vec![1, 2],
            vec![
                MemberAddrs {
                    fabric: "127.0.0.1:9001".parse()?,
                    gms: "127.0.0.1:9101".parse()?,
                },
                MemberAddrs {
                    fabric: "127.0.0.1:9002".parse()?,
                    gms: "127.0.0.1:9102".parse()?,
                },
            ],
            1,
            vec![2],
            vec![],
            &SubgroupSpec::one_shard_of_everyone("chat", Mode::Ordered),
        )
        .unwrap();
        save_view(path, &view)?;
        assert_eq!(load_view(path)?, view);
        Ok(())
    }
}
