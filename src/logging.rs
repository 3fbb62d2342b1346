// Copyright 2025 The stoker authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Log output setup.
//!
//! Log files are named `YYYY_MM_DD.log` under a configured directory; a
//! new file starts on day change and after every 50,000 lines (the extra
//! files of a day carry an `_N` suffix). With a queue size above zero the
//! writer runs behind an in-process queue on its own thread; otherwise
//! writes happen inline.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::EnvFilter;

/// Lines per file before rolling over within the same day.
const MAX_LINES: u64 = 50_000;

/// Appending file writer that rolls on day change and line count.
#[derive(Debug)]
struct RollingWriter {
    dir: PathBuf,
    file: File,
    day: NaiveDate,
    lines: u64,
    rollover: u32,
    max_lines: u64,
}

impl RollingWriter {
    fn create(dir: PathBuf, max_lines: u64) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let day = Local::now().date_naive();
        let file = Self::open(&dir, day, 0)?;
        Ok(Self {
            dir,
            file,
            day,
            lines: 0,
            rollover: 0,
            max_lines,
        })
    }

    fn open(dir: &Path, day: NaiveDate, rollover: u32) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(Self::file_name(day, rollover)))
    }

    fn file_name(day: NaiveDate, rollover: u32) -> String {
        let base = format!("{:04}_{:02}_{:02}", day.year(), day.month(), day.day());
        if rollover == 0 {
            format!("{base}.log")
        } else {
            format!("{base}_{rollover}.log")
        }
    }

    fn roll_if_needed(&mut self) -> io::Result<()> {
        let today = Local::now().date_naive();
        if today != self.day {
            self.day = today;
            self.lines = 0;
            self.rollover = 0;
        } else if self.lines >= self.max_lines {
            self.lines = 0;
            self.rollover += 1;
        } else {
            return Ok(());
        }
        self.file.flush()?;
        self.file = Self::open(&self.dir, self.day, self.rollover)?;
        Ok(())
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.roll_if_needed()?;
        self.lines += buf.iter().filter(|&&byte| byte == b'\n').count() as u64;
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Installs the global subscriber. Returns the writer-thread guard when
/// running asynchronously; dropping it flushes the queue on shutdown.
/// With logging disabled nothing is installed and log macros are no-ops.
pub fn init(enabled: bool, level: &str, dir: PathBuf, queue_size: usize) -> Result<Option<WorkerGuard>> {
    if !enabled {
        return Ok(None);
    }
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .with_context(|| format!("bad log level {level:?}"))?;
    let writer = RollingWriter::create(dir, MAX_LINES).context("cannot open log directory")?;
    if queue_size > 0 {
        let (non_blocking, guard) = NonBlockingBuilder::default()
            .buffered_lines_limit(queue_size)
            .lossy(true)
            .finish(writer);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .try_init()
            .map_err(|err| anyhow::anyhow!("subscriber already set: {err}"))?;
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(writer))
            .with_ansi(false)
            .try_init()
            .map_err(|err| anyhow::anyhow!("subscriber already set: {err}"))?;
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use chrono::{Local, NaiveDate};
    use tempfile::TempDir;

    use super::RollingWriter;

    #[test]
    fn file_names_follow_the_date_pattern() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        assert_eq!("2025_03_07.log", RollingWriter::file_name(day, 0));
        assert_eq!("2025_03_07_2.log", RollingWriter::file_name(day, 2));
    }

    #[test]
    fn todays_file_is_created_in_the_directory() {
        let dir = TempDir::new().unwrap();
        let mut writer = RollingWriter::create(dir.path().to_path_buf(), 10).unwrap();
        writeln!(writer, "hello").unwrap();
        writer.flush().unwrap();
        let expected = RollingWriter::file_name(Local::now().date_naive(), 0);
        let content = std::fs::read_to_string(dir.path().join(expected)).unwrap();
        assert_eq!("hello\n", content);
    }

    #[test]
    fn line_limit_rolls_to_a_suffixed_file() {
        let dir = TempDir::new().unwrap();
        let mut writer = RollingWriter::create(dir.path().to_path_buf(), 3).unwrap();
        for i in 0..5 {
            writeln!(writer, "line {i}").unwrap();
        }
        writer.flush().unwrap();
        let today = Local::now().date_naive();
        let first = std::fs::read_to_string(dir.path().join(RollingWriter::file_name(today, 0)));
        let second = std::fs::read_to_string(dir.path().join(RollingWriter::file_name(today, 1)));
        assert_eq!(3, first.unwrap().lines().count());
        assert_eq!(2, second.unwrap().lines().count());
    }

    #[test]
    fn missing_directories_are_created() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let mut writer = RollingWriter::create(nested.clone(), 10).unwrap();
        writeln!(writer, "nested").unwrap();
        writer.flush().unwrap();
        assert!(nested.exists());
    }
}
