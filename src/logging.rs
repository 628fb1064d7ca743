//! Diagnostics sink for tick reports. Library internals log through `tracing`;
//! this is for frame loops that want a plain transcript of what their
//! microthreads did.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::scheduler::TickReport;

/// Where a [Logger] writes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogStrategy {
  /// Write to stderr
  StdErr,
  /// Append to a file, creating it if necessary
  File(PathBuf),
  /// Drop everything
  Discard,
}

/// Writes lines according to a [LogStrategy]
#[derive(Clone, Debug)]
pub struct Logger(LogStrategy);
impl Logger {
  /// Create a logger
  pub fn new(strat: LogStrategy) -> Self { Self(strat) }

  /// Write one line
  pub fn log(&self, msg: impl AsRef<str>) -> io::Result<()> {
    match &self.0 {
      LogStrategy::StdErr => writeln!(io::stderr().lock(), "{}", msg.as_ref()),
      LogStrategy::File(path) => {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", msg.as_ref())
      },
      LogStrategy::Discard => Ok(()),
    }
  }

  /// Write a report unless nothing finished in the tick
  pub fn report(&self, report: &TickReport) -> io::Result<()> {
    if report.is_quiet() && !report.deferred {
      return Ok(());
    }
    self.log(report.to_string())
  }

  /// The strategy this logger was created with
  pub fn strat(&self) -> LogStrategy { self.0.clone() }
}

#[cfg(test)]
mod test {
  use std::fs;
  use std::process;

  use super::{LogStrategy, Logger};
  use crate::scheduler::{Scheduler, TickReport};

  #[test]
  fn file_logger_appends_reports() {
    let path = std::env::temp_dir().join(format!("microthread-log-{}.txt", process::id()));
    let _ = fs::remove_file(&path);
    let logger = Logger::new(LogStrategy::File(path.clone()));
    let sched = Scheduler::new();
    sched.add(0, |_| async { Ok(()) });
    logger.report(&sched.run_tick().unwrap()).unwrap();
    logger.report(&TickReport { tick: 2, ..TickReport::default() }).unwrap();
    logger.log("done").unwrap();
    let text = fs::read_to_string(&path).unwrap();
    let lines = text.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 2, "quiet ticks are skipped: {text}");
    assert!(lines[0].starts_with("tick 1: 1 resumed, completed [#"));
    assert_eq!(lines[1], "done");
    fs::remove_file(&path).unwrap();
  }

  #[test]
  fn discard_accepts_anything() {
    let logger = Logger::new(LogStrategy::Discard);
    logger.log("nothing").unwrap();
    assert_eq!(logger.strat(), LogStrategy::Discard);
  }
}
