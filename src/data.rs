use crate::analysis::KandlerSurvival;
use crate::config::Config;
use crate::counts::DiversityReport;
use crate::population::EventCounter;
use anyhow::{Context, Result};
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, ErrorKind, Write},
    path::Path,
};

/// Statistics of one run at one tick.
///
/// Intermediate snapshots only carry the population and sampled reports; the
/// final record also carries the survival and time averaged statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub simulation_id: String,
    pub experiment: String,
    pub tick: u64,
    pub config: Config,

    pub population: DiversityReport,
    #[serde(default)]
    pub kandler: Option<KandlerSurvival>,
    /// Keyed by sample size.
    #[serde(default)]
    pub sampled: BTreeMap<usize, DiversityReport>,

    /// Keyed by window duration.
    #[serde(default)]
    pub time_averaged: Option<BTreeMap<u64, DiversityReport>>,
    #[serde(default)]
    pub ta_kandler: Option<BTreeMap<u64, KandlerSurvival>>,
    /// Keyed by window duration, then sample size.
    #[serde(default)]
    pub ta_sampled: Option<BTreeMap<u64, BTreeMap<usize, DiversityReport>>>,
    #[serde(default)]
    pub ta_sampled_kandler: Option<BTreeMap<u64, BTreeMap<usize, KandlerSurvival>>>,
}

impl SampleRecord {
    pub fn is_final(&self) -> bool {
        self.time_averaged.is_some()
    }
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRecord {
    pub simulation_id: String,
    pub experiment: String,
    pub command_line: String,
    pub seed: u64,
    pub config: Config,
    pub final_tick: u64,
    pub elapsed_secs: f64,
    pub interactions: EventCounter,
    pub innovations: EventCounter,
}

impl SimulationRecord {
    pub fn save<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self).context("failed to serialize record")?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).context("failed to deserialize record")
    }
}

/// Stream of [`SampleRecord`]s written to a MessagePack file.
pub struct RecordWriter {
    writer: BufWriter<File>,
    n_records: usize,
}

impl RecordWriter {
    pub fn create<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        Ok(Self {
            writer: BufWriter::new(file),
            n_records: 0,
        })
    }

    pub fn write(&mut self, record: &SampleRecord) -> Result<()> {
        encode::write_named(&mut self.writer, record).context("failed to serialize record")?;
        self.n_records += 1;
        Ok(())
    }

    /// Flush the stream and return the number of records written.
    pub fn finish(mut self) -> Result<usize> {
        self.writer
            .flush()
            .context("failed to flush writer stream")?;
        Ok(self.n_records)
    }
}

/// Read every record of a file written by [`RecordWriter`].
pub fn read_records<P: AsRef<Path>>(file: P) -> Result<Vec<SampleRecord>> {
    let file = file.as_ref();
    let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
    let mut reader = BufReader::new(file);

    let mut records = Vec::new();
    loop {
        match decode::from_read(&mut reader) {
            Ok(record) => records.push(record),
            Err(decode::Error::InvalidMarkerRead(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                break;
            }
            Err(err) => {
                return Err(err).context(format!("failed to read record {}", records.len()));
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::TraitCounts;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;
    use std::env;

    fn record(tick: u64, final_record: bool) -> SampleRecord {
        let mut counts = TraitCounts::new(2);
        counts.observe(&[1, 2]);
        counts.observe(&[1, 3]);
        counts.observe(&[4, 3]);
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let report = counts.report(20, &mut rng);
        SampleRecord {
            simulation_id: "urn:uuid:test".to_string(),
            experiment: "test".to_string(),
            tick,
            config: Config::for_tests(4, 2, 5),
            population: report.clone(),
            kandler: None,
            sampled: BTreeMap::from([(2, report.clone())]),
            time_averaged: final_record.then(|| BTreeMap::from([(1, report.clone())])),
            ta_kandler: None,
            ta_sampled: final_record
                .then(|| BTreeMap::from([(1, BTreeMap::from([(2, report.clone())]))])),
            ta_sampled_kandler: None,
        }
    }

    #[test]
    fn streams_records() {
        let dir = env::temp_dir().join(format!("ctmixtures-data-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("samples.msgpack");

        let records = vec![record(10, false), record(20, false), record(30, true)];
        let mut writer = RecordWriter::create(&file).unwrap();
        for record in &records {
            writer.write(record).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 3);

        let read = read_records(&file).unwrap();
        assert_eq!(read, records);
        assert!(read[2].is_final());
        assert!(!read[0].is_final());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
