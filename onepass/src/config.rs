//! Request configuration from YAML. Crashes are most likely to originate
//! from this code, intentionally: every key is checked here once.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use onepass_engine::{RawRequest, Request, request};

/// Errors produced by [`load`] and [`parse`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The request is invalid
    #[error("Invalid request: {0}")]
    Request(#[from] request::Error),
}

/// Read and validate the request at `path`
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not a valid request
/// document or fails validation.
pub fn load(path: &Path) -> Result<Request, Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    parse(&contents)
}

/// Validate the request in `contents`
///
/// # Errors
///
/// Returns an error if `contents` is not a valid request document or fails
/// validation.
pub fn parse(contents: &str) -> Result<Request, Error> {
    let raw: RawRequest = serde_yaml::from_str(contents)?;
    Ok(Request::try_from(raw)?)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use onepass_engine::{Statistic, clock::Cadence};

    #[test]
    fn config_deserializes() {
        let contents = r#"
stat: thresh_exceed
stat_freq: daily
output_freq: monthly
time_step: 60
variable: pr
save: false
checkpoint: true
checkpoint_filepath: /tmp/onepass
thresh_exceed: [1.0, 10.0]
"#;
        let request = parse(contents).unwrap();
        assert_eq!(
            request.statistic,
            Statistic::ThreshExceed {
                thresholds: vec![1.0, 10.0]
            }
        );
        assert_eq!(request.stat_freq, Cadence::Daily);
        assert_eq!(request.output_freq, Cadence::Monthly);
        assert_eq!(
            request.checkpoint_filepath,
            Some(PathBuf::from("/tmp/onepass"))
        );
    }

    #[test]
    fn percentile_keyword_accepted() {
        let contents = r#"
stat: percentile
stat_freq: monthly
time_step: 30
variable: tas
save: false
checkpoint: false
percentile_list: all
compression: 2.5
"#;
        let request = parse(contents).unwrap();
        let Statistic::Percentile { quantiles } = request.statistic else {
            panic!("expected percentile");
        };
        assert_eq!(quantiles.len(), 100);
        assert_eq!(request.output_freq, Cadence::Monthly);
    }

    #[test]
    fn unknown_key_rejected() {
        let contents = r#"
stat: mean
stat_freq: daily
time_step: 60
variable: tas
save: false
checkpoint: false
window: 3
"#;
        assert!(matches!(parse(contents), Err(Error::SerdeYaml(_))));
    }

    #[test]
    fn invalid_request_rejected() {
        let contents = r#"
stat: mean
stat_freq: daily
time_step: 60
variable: tas
save: true
checkpoint: false
"#;
        assert!(matches!(
            parse(contents),
            Err(Error::Request(request::Error::MissingKey("save_filepath")))
        ));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "stat: max\nstat_freq: hourly\ntime_step: 15\nvariable: tas\nsave: false\ncheckpoint: false"
        )
        .unwrap();
        let request = load(file.path()).unwrap();
        assert_eq!(request.statistic, Statistic::Max);
        assert_eq!(request.time_step, 15);

        let missing = file.path().with_extension("missing");
        assert!(matches!(load(&missing), Err(Error::ReadFile { .. })));
    }
}
