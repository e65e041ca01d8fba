pub mod forces;

use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum IngestorError {
    #[error("Failed to read solver output {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No force or coefficient data found in {0:?}")]
    NoData(PathBuf),
    #[error("Failed to compile region pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

impl IngestorError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One parsed row of the coefficient output: the iteration index plus one value per tracked field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub iteration: u64,
    pub values: Vec<f64>,
}

/// Append-only, strictly increasing (in iteration) record of coefficient samples.
///
/// Long runs are thinned on ingest: once more than `limit` samples are retained every other one
/// is dropped and only every `stride`-th accepted sample is kept from then on. The latest accepted
/// sample is always available through `latest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceHistory {
    pub fields: Vec<String>,
    pub samples: Vec<Sample>,
    latest: Option<Sample>,
    stride: u64,
    accepted: u64,
    limit: usize,
    frozen: bool,
}

impl Default for ConvergenceHistory {
    fn default() -> Self {
        Self::with_limit(DEFAULT_HISTORY_LIMIT)
    }
}

pub const DEFAULT_HISTORY_LIMIT: usize = 5000;

impl ConvergenceHistory {
    /// a limit of 0 retains every sample
    pub fn with_limit(limit: usize) -> Self {
        Self {
            fields: Vec::new(),
            samples: Vec::new(),
            latest: None,
            stride: 1,
            accepted: 0,
            limit,
            frozen: false,
        }
    }

    pub fn set_fields(&mut self, fields: &[String]) {
        if self.fields.is_empty() {
            self.fields = fields.to_vec();
        }
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.latest.as_ref()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// no more samples are accepted once the solve stage is left
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Append a sample, returns false if it was rejected because the history is frozen or the
    /// iteration does not advance past the latest accepted one.
    pub fn push(&mut self, sample: Sample) -> bool {
        if self.frozen {
            return false;
        }
        if let Some(ref latest) = self.latest {
            if sample.iteration <= latest.iteration {
                return false;
            }
        }

        let keep = self.accepted % self.stride == 0;
        self.accepted += 1;
        self.latest = Some(sample.clone());

        if keep {
            self.samples.push(sample);

            if self.limit > 0 && self.samples.len() > self.limit {
                self.decimate();
            }
        }

        true
    }

    fn decimate(&mut self) {
        let mut index = 0usize;
        self.samples.retain(|_| {
            index += 1;
            index % 2 == 1
        });
        self.stride *= 2;

        debug!(
            retained = self.samples.len(),
            stride = self.stride,
            "Thinned convergence history"
        );
    }

    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|name| name == field)
    }

    /// Whether `field` varied by less than `tolerance` over the last `window` retained samples,
    /// `None` if there are not enough samples to tell.
    pub fn is_settled(&self, field: &str, window: usize, tolerance: f64) -> Option<bool> {
        let index = self.field_index(field)?;
        if window == 0 || self.samples.len() < window {
            return None;
        }

        let (min, max) = self.samples[self.samples.len() - window..]
            .iter()
            .filter_map(|sample| sample.values.get(index))
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), value| {
                (min.min(*value), max.max(*value))
            });

        Some(max - min < tolerance)
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum Row {
    /// comment or empty line
    Skip,
    /// header naming the value columns
    Header(Vec<String>),
    Sample(Sample),
    /// fewer value columns than expected, possibly not yet flushed
    Partial,
    Malformed,
}

/// Split a data row into numeric tokens, parentheses are treated like whitespace so that vector
/// columns such as `((px py pz) (vx vy vz))` flatten into plain numbers.
pub(crate) fn tokens(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .filter(|token| !token.is_empty())
}

/// iteration indices are written either as integers or as integral floats
pub(crate) fn parse_iteration(token: &str) -> Option<u64> {
    if let Ok(iteration) = token.parse::<u64>() {
        return Some(iteration);
    }

    let value = token.parse::<f64>().ok()?;
    (value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64)
        .then_some(value as u64)
}

pub(crate) fn parse_row(line: &str, expected: usize) -> Row {
    let line = line.trim();

    if line.is_empty() {
        return Row::Skip;
    }
    if let Some(comment) = line.strip_prefix('#') {
        let mut names = comment.split_whitespace();

        return match names.next() {
            Some(first)
                if ["time", "iteration", "iter"]
                    .iter()
                    .any(|label| first.eq_ignore_ascii_case(label)) =>
            {
                let fields: Vec<String> = names.map(str::to_owned).collect();
                if fields.is_empty() {
                    Row::Skip
                } else {
                    Row::Header(fields)
                }
            }
            _ => Row::Skip,
        };
    }

    let mut parts = tokens(line);
    let Some(iteration) = parts.next().and_then(parse_iteration) else {
        return Row::Malformed;
    };

    let raw = parts.take(expected).collect::<Vec<_>>();
    if raw.len() < expected {
        return Row::Partial;
    }

    match raw
        .into_iter()
        .map(str::parse::<f64>)
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(values) => Row::Sample(Sample { iteration, values }),
        Err(_) => Row::Malformed,
    }
}

/// Incremental reader over the coefficient file the solver appends to.
///
/// Every poll continues from the offset of the last consumed line. A trailing line without a
/// newline is left in place until the solver finishes writing it.
#[derive(Debug, Clone)]
pub struct CoefficientTail {
    path: PathBuf,
    offset: u64,
    fields: Vec<String>,
}

impl CoefficientTail {
    pub fn new(path: impl Into<PathBuf>, default_fields: &[String]) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            fields: default_fields.to_vec(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// read rows appended since the last poll
    pub fn poll(&mut self) -> Result<Vec<Sample>, IngestorError> {
        self.read(false)
    }

    /// Final read once the solver has exited, the trailing line is accepted if it is complete
    /// even without a newline.
    pub fn finish(&mut self) -> Result<Vec<Sample>, IngestorError> {
        self.read(true)
    }

    fn read(&mut self, finished: bool) -> Result<Vec<Sample>, IngestorError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            // the solver has not produced any output yet
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(IngestorError::io(&self.path, error)),
        };

        let length = file
            .metadata()
            .map_err(|error| IngestorError::io(&self.path, error))?
            .len();
        if length < self.offset {
            debug!(path = ?self.path, "Output file shrank, reading from the start again");
            self.offset = 0;
        }
        if length == self.offset {
            return Ok(Vec::new());
        }

        let mut buffer = Vec::with_capacity((length - self.offset) as usize);
        file.seek(SeekFrom::Start(self.offset))
            .and_then(|_| file.read_to_end(&mut buffer))
            .map_err(|error| IngestorError::io(&self.path, error))?;

        let mut samples = Vec::new();
        let mut consumed = 0usize;

        while consumed < buffer.len() {
            let rest = &buffer[consumed..];
            let (line, length, terminated) = match rest.iter().position(|byte| *byte == b'\n') {
                Some(end) => (&rest[..end], end + 1, true),
                None => (rest, rest.len(), false),
            };
            // the solver may still be writing this line, whatever kind of row it turns out to be
            if !terminated && !finished {
                break;
            }
            let line = String::from_utf8_lossy(line);

            match parse_row(&line, self.fields.len()) {
                Row::Skip => {}
                Row::Header(fields) => self.fields = fields,
                Row::Sample(sample) => samples.push(sample),
                row => debug!(path = ?self.path, line = %line, row = ?row, "Skipped unusable row"),
            }

            consumed += length;
        }

        self.offset += consumed as u64;
        trace!(path = ?self.path, offset = self.offset, rows = samples.len(), "Polled solver output");

        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fields() -> Vec<String> {
        ["Cm", "Cd", "Cl"].map(String::from).to_vec()
    }

    fn sample(iteration: u64) -> Sample {
        Sample {
            iteration,
            values: vec![0.0, 0.5, 0.1],
        }
    }

    #[test]
    fn rows_are_classified() {
        assert_eq!(parse_row("# comment", 3), Row::Skip);
        assert_eq!(
            parse_row("# Time Cm Cd Cl Cl(f) Cl(r)", 3),
            Row::Header(
                ["Cm", "Cd", "Cl", "Cl(f)", "Cl(r)"]
                    .map(String::from)
                    .to_vec()
            )
        );
        assert_eq!(
            parse_row("12 0.1 0.2 0.3", 3),
            Row::Sample(Sample {
                iteration: 12,
                values: vec![0.1, 0.2, 0.3]
            })
        );
        assert_eq!(parse_row("12 0.1 0.2", 3), Row::Partial);
        assert_eq!(parse_row("12 0.1 abc 0.3", 3), Row::Malformed);
        assert_eq!(parse_row("0.5 0.1 0.2 0.3", 3), Row::Malformed);
        assert!(matches!(parse_row("100.0 1 2 3", 3), Row::Sample(s) if s.iteration == 100));
    }

    #[test]
    fn history_rejects_regressions() {
        let mut history = ConvergenceHistory::default();

        assert!(history.push(sample(1)));
        assert!(history.push(sample(2)));
        assert!(!history.push(sample(2)));
        assert!(!history.push(sample(1)));
        assert_eq!(history.len(), 2);

        history.freeze();
        assert!(!history.push(sample(3)));
        assert_eq!(history.latest().map(|s| s.iteration), Some(2));
    }

    #[test]
    fn history_thins_on_ingest() {
        let mut history = ConvergenceHistory::with_limit(10);

        for iteration in 1..=100 {
            history.push(sample(iteration));
        }

        assert!(history.len() <= 10);
        assert_eq!(history.latest().map(|s| s.iteration), Some(100));
        assert!(history
            .samples
            .windows(2)
            .all(|pair| pair[0].iteration < pair[1].iteration));
    }

    #[test]
    fn settled_detection() {
        let mut history = ConvergenceHistory::with_limit(0);
        history.set_fields(&fields());

        for iteration in 1..=60 {
            history.push(Sample {
                iteration,
                values: vec![0.0, 0.4 + 1.0 / iteration as f64, 0.0],
            });
        }

        assert_eq!(history.is_settled("Cd", 50, 0.1), Some(true));
        assert_eq!(history.is_settled("Cd", 60, 0.1), Some(false));
        assert_eq!(history.is_settled("Cd", 61, 0.1), None);
        assert_eq!(history.is_settled("Cx", 10, 0.1), None);
    }

    #[test]
    fn tail_waits_for_unterminated_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forceCoeffs.dat");
        let mut file = File::create(&path).unwrap();
        let mut tail = CoefficientTail::new(&path, &fields());

        write!(file, "# Time Cm Cd Cl\n1 0.0 0.5 0.1\n2 0.0 0.4").unwrap();
        file.flush().unwrap();

        let first = tail.poll().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].iteration, 1);

        // nothing new: polling again yields nothing
        assert!(tail.poll().unwrap().is_empty());

        writeln!(file, "8 0.1").unwrap();
        writeln!(file, "3 0.0 0.3 0.1").unwrap();
        file.flush().unwrap();

        let second = tail.poll().unwrap();
        assert_eq!(
            second,
            vec![
                Sample {
                    iteration: 2,
                    values: vec![0.0, 0.48, 0.1]
                },
                Sample {
                    iteration: 3,
                    values: vec![0.0, 0.3, 0.1]
                }
            ]
        );
    }

    #[test]
    fn tail_keeps_a_header_written_in_two_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forceCoeffs.dat");
        let mut file = File::create(&path).unwrap();
        let mut tail = CoefficientTail::new(&path, &fields());

        write!(file, "# Time Cm").unwrap();
        file.flush().unwrap();
        assert!(tail.poll().unwrap().is_empty());
        assert_eq!(tail.offset(), 0);

        write!(file, " Cd Cl\n1 0.0 0.5 0.1\n").unwrap();
        file.flush().unwrap();

        assert_eq!(tail.poll().unwrap(), vec![sample(1)]);
        assert_eq!(tail.fields(), fields().as_slice());
    }

    #[test]
    fn tail_accepts_trailing_row_when_finished() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forceCoeffs.dat");
        std::fs::write(&path, "1 0.0 0.5 0.1\n2 0.0 0.4 0.1").unwrap();

        let mut tail = CoefficientTail::new(&path, &fields());
        assert_eq!(tail.poll().unwrap().len(), 1);
        assert_eq!(tail.finish().unwrap().len(), 1);
        assert!(tail.finish().unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut tail = CoefficientTail::new(dir.path().join("absent.dat"), &fields());

        assert!(tail.poll().unwrap().is_empty());
    }
}
