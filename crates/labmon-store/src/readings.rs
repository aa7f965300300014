//! Bounded, file-backed readings ring.
//!
//! Samples append at the tail; once the ring holds more than the cap the
//! oldest entries are dropped. The cap is global across setups, matching the
//! original deployment's behavior. An in-memory deque serves queries in O(k)
//! while `readings.json` is kept in sync behind a persistence lock.
//!
//! Timestamps are strictly monotonic per setup: a sample stamped at or
//! before its predecessor is nudged forward by one microsecond before it is
//! stored.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use labmon_core::model::Sample;
use labmon_core::MonitorResult;

use crate::json_file::JsonFile;

/// Default maximum number of retained samples.
pub const DEFAULT_READINGS_CAP: usize = 10_000;

/// UTC now truncated to microsecond precision, the resolution stored in the
/// readings file.
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

pub struct ReadingsRing {
    file: JsonFile<Sample>,
    cap: usize,
    view: RwLock<VecDeque<Sample>>,
    last_ts: Mutex<HashMap<u64, DateTime<Utc>>>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl ReadingsRing {
    /// Open `readings.json` under the data directory and warm the in-memory
    /// view from it. An over-long file (cap lowered since it was written) is
    /// trimmed on load.
    pub async fn open(data_dir: impl AsRef<Path>, cap: usize) -> MonitorResult<Self> {
        let file = JsonFile::open(data_dir.as_ref().join("readings.json")).await?;
        let mut existing: VecDeque<Sample> = file.load().await?.into();
        while existing.len() > cap {
            existing.pop_front();
        }

        let mut last_ts = HashMap::new();
        for sample in &existing {
            let entry = last_ts
                .entry(sample.setup_id)
                .or_insert(sample.timestamp);
            if sample.timestamp > *entry {
                *entry = sample.timestamp;
            }
        }

        Ok(Self {
            file,
            cap,
            view: RwLock::new(existing),
            last_ts: Mutex::new(last_ts),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Append one sample, trim to the cap, and persist.
    ///
    /// Returns the sample as stored (its timestamp may have been nudged to
    /// keep the per-setup order strict).
    pub async fn append(&self, mut sample: Sample) -> MonitorResult<Sample> {
        {
            let mut last_ts = self.last_ts.lock();
            if let Some(last) = last_ts.get(&sample.setup_id) {
                if sample.timestamp <= *last {
                    sample.timestamp = *last + chrono::Duration::microseconds(1);
                }
            }
            last_ts.insert(sample.setup_id, sample.timestamp);
        }

        {
            let mut view = self.view.write();
            view.push_back(sample.clone());
            while view.len() > self.cap {
                view.pop_front();
            }
        }

        self.persist().await?;
        Ok(sample)
    }

    /// Most recent `k` samples for a setup, newest first.
    pub fn latest(&self, setup_id: u64, k: usize) -> Vec<Sample> {
        self.view
            .read()
            .iter()
            .rev()
            .filter(|s| s.setup_id == setup_id)
            .take(k)
            .cloned()
            .collect()
    }

    /// Most recent `k` samples across all setups, newest first.
    pub fn latest_any(&self, k: usize) -> Vec<Sample> {
        self.view.read().iter().rev().take(k).cloned().collect()
    }

    /// Samples for a setup not older than `age`, newest first.
    pub fn since(&self, setup_id: u64, age: Duration) -> Vec<Sample> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        self.view
            .read()
            .iter()
            .rev()
            .filter(|s| s.setup_id == setup_id && s.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Drop every sample of one setup. Returns how many were removed.
    pub async fn clear_setup(&self, setup_id: u64) -> MonitorResult<usize> {
        let removed = {
            let mut view = self.view.write();
            let before = view.len();
            view.retain(|s| s.setup_id != setup_id);
            before - view.len()
        };
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.view.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.read().is_empty()
    }

    async fn persist(&self) -> MonitorResult<()> {
        // Snapshot under the persistence lock so a slower save can never
        // overwrite a newer one.
        let _guard = self.persist_lock.lock().await;
        let snapshot: Vec<Sample> = self.view.read().iter().cloned().collect();
        self.file.save(&snapshot).await
    }
}
