use crate::corpus::SeedRecord;
use crate::crash::{CrashArtifact, StuckPc};
use crate::input::{Candidate, Input};
use log::debug;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const HASH_PREFIX_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode artifact metadata: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct CrashRecord<'a> {
    #[serde(flatten)]
    seed: SeedRecord,
    label: String,
    queue: &'static str,
    opcode: String,
    namespace: u32,
    data_len: u32,
    reason: &'a str,
    timestamp_ms: u128,
    input_hash: &'a str,
    stuck_pcs: Vec<String>,
    stuck_pcs_unique: Vec<String>,
    stuck_pcs_count: usize,
    stuck_pc_top5: Vec<StuckPc>,
}

/// Output directory layout: `corpus/` for admitted seeds, `crashes/` for
/// timeout artifacts, coverage files at the top level.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    corpus_dir: PathBuf,
    crashes_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            corpus_dir: root.join("corpus"),
            crashes_dir: root.join("crashes"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn corpus_dir(&self) -> &Path {
        &self.corpus_dir
    }

    pub fn crashes_dir(&self) -> &Path {
        &self.crashes_dir
    }

    pub fn prepare(&self) -> Result<(), ArtifactError> {
        for dir in [&self.root, &self.corpus_dir, &self.crashes_dir] {
            fs::create_dir_all(dir).map_err(|source| ArtifactError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn stem(prefix: &str, candidate: &Candidate) -> String {
        let hash = format!("{:x}", md5::compute(candidate.as_bytes()));
        format!(
            "{}_{}_{:#04x}_{}",
            prefix,
            candidate.label(),
            candidate.effective_opcode(),
            &hash[..HASH_PREFIX_LEN]
        )
    }

    /// Writes an admitted seed and its sidecar. Returns the payload path.
    pub fn save_corpus_entry(&self, candidate: &Candidate) -> Result<PathBuf, ArtifactError> {
        let path = self.corpus_dir.join(Self::stem("input", candidate));
        write_file(&path, candidate.as_bytes())?;
        let record = serde_json::to_vec(&SeedRecord::of(candidate))?;
        write_file(&with_suffix(&path, ".json"), &record)?;
        debug!("Saved corpus entry {:?}", path);
        Ok(path)
    }

    /// Writes the payload, a JSON description and the external log of a crash.
    pub fn save_crash(&self, artifact: &CrashArtifact) -> Result<PathBuf, ArtifactError> {
        let path = self.crashes_dir.join(Self::stem("crash", &artifact.candidate));
        write_file(&path, artifact.candidate.as_bytes())?;

        let hex = |pcs: &[u32]| pcs.iter().map(|pc| format!("{pc:#x}")).collect::<Vec<_>>();
        let encoded = &artifact.encoded;
        let record = CrashRecord {
            seed: SeedRecord::of(&artifact.candidate),
            label: encoded.label.to_string(),
            queue: encoded.queue.as_str(),
            opcode: format!("{:#04x}", encoded.opcode),
            namespace: encoded.namespace,
            data_len: encoded.data_len,
            reason: &artifact.reason,
            timestamp_ms: artifact.timestamp_ms,
            input_hash: &artifact.input_hash,
            stuck_pcs: hex(&artifact.stuck.samples),
            stuck_pcs_unique: hex(&artifact.stuck.unique()),
            stuck_pcs_count: artifact.stuck.samples.len(),
            stuck_pc_top5: artifact.top_stuck(),
        };
        write_file(&with_suffix(&path, ".json"), &serde_json::to_vec_pretty(&record)?)?;

        if !artifact.external_log.is_empty() {
            write_file(&with_suffix(&path, ".log.txt"), artifact.external_log.as_bytes())?;
        }
        Ok(path)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    fs::write(path, bytes).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::load_seed_dir;
    use crate::crash::StuckTrace;
    use crate::input::{Fields, Override};
    use crate::protocol::{enabled_commands, find_command};

    fn write_candidate() -> Candidate {
        Candidate::new(
            find_command("Write").expect("write"),
            b"abc".to_vec(),
            Fields {
                cdw12: 3,
                ..Fields::default()
            },
        )
    }

    #[test]
    fn corpus_entries_round_trip_through_seed_loader() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        store.prepare().expect("prepare");

        let mut cand = write_candidate();
        cand.overrides.set(Override::DataLength(4096));
        let path = store.save_corpus_entry(&cand).expect("save");
        let name = path.file_name().and_then(|n| n.to_str()).expect("name");
        assert_eq!(name, "input_Write_0x01_900150983cd2");

        let loaded = load_seed_dir(store.corpus_dir(), &enabled_commands(&[], false)).expect("load");
        assert_eq!(loaded, vec![cand]);
    }

    #[test]
    fn opcode_override_shows_in_file_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        store.prepare().expect("prepare");
        let mut cand = write_candidate();
        cand.overrides.set(Override::Opcode(0x99));
        let path = store.save_corpus_entry(&cand).expect("save");
        let name = path.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("input_unknown_op0x99_0x99_"), "{name}");
    }

    #[test]
    fn crash_artifact_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        store.prepare().expect("prepare");

        let cand = write_candidate();
        let encoded = cand.encode(1);
        let artifact = CrashArtifact::new(
            cand,
            encoded,
            "timeout",
            StuckTrace::new(vec![0x4000, 0x4000, 0x4010]),
            "nvme nvme0: I/O 12 QID 0 timeout".to_string(),
        );
        let path = store.save_crash(&artifact).expect("save crash");
        assert_eq!(fs::read(&path).expect("payload"), b"abc");

        let meta: serde_json::Value =
            serde_json::from_slice(&fs::read(with_suffix(&path, ".json")).expect("json")).expect("parse");
        assert_eq!(meta["command"], "Write");
        assert_eq!(meta["cdw12"], 3);
        assert_eq!(meta["reason"], "timeout");
        assert_eq!(meta["opcode"], "0x01");
        assert_eq!(meta["stuck_pcs_count"], 3);
        assert_eq!(meta["stuck_pcs_unique"], serde_json::json!(["0x4000", "0x4010"]));
        assert_eq!(meta["stuck_pc_top5"][0]["pc"], "0x4000");
        assert_eq!(meta["stuck_pc_top5"][0]["count"], 2);

        let log = fs::read_to_string(with_suffix(&path, ".log.txt")).expect("log");
        assert!(log.contains("QID 0 timeout"));
    }

    #[test]
    fn unwritable_crash_log_fails_the_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        store.prepare().expect("prepare");

        let cand = write_candidate();
        let encoded = cand.encode(1);
        let artifact = CrashArtifact::new(
            cand,
            encoded,
            "timeout",
            StuckTrace::new(vec![0x4000]),
            "nvme nvme0: I/O 3 QID 1 timeout".to_string(),
        );
        let path = store.save_crash(&artifact).expect("first save");
        let log_path = with_suffix(&path, ".log.txt");
        fs::remove_file(&log_path).expect("remove log");
        fs::create_dir(&log_path).expect("block log path");

        match store.save_crash(&artifact) {
            Err(ArtifactError::Io { path, .. }) => assert_eq!(path, log_path),
            other => panic!("expected an I/O error on the log, got {other:?}"),
        }
    }
}
