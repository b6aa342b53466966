//! Daily pick log
//!
//! Appends one line per processed pick to `<prefix>.<YYYY-MM-DD>`, switching
//! files when the processing date changes.

use crate::model::{time2str, Pick};
use chrono::NaiveDate;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

pub struct PickLog {
    prefix: String,
    date: Option<NaiveDate>,
    writer: Option<BufWriter<File>>,
}

/// Log line for a pick: time, stream, snr, amplitude, period, status, id
pub fn format_pick(pick: &Pick) -> String {
    let loc = if pick.loc.is_empty() { "__" } else { pick.loc.as_str() };
    format!(
        "{} {:<2} {:<6} {:<3} {:<2} {:6.1} {:10.3} {:4.1} {} {}",
        time2str(pick.time),
        pick.net,
        pick.sta,
        pick.cha,
        loc,
        pick.snr,
        pick.amp,
        pick.per,
        pick.status_flag(),
        pick.id
    )
}

impl PickLog {
    pub fn new(prefix: String) -> Self {
        Self {
            prefix,
            date: None,
            writer: None,
        }
    }

    /// File name used for `date`
    pub fn file_name(&self, date: NaiveDate) -> String {
        format!("{}.{}", self.prefix, date.format("%Y-%m-%d"))
    }

    fn rotate(&mut self, date: NaiveDate) -> std::io::Result<&mut BufWriter<File>> {
        if self.date != Some(date) || self.writer.is_none() {
            if let Some(mut old) = self.writer.take() {
                old.flush()?;
            }
            let name = self.file_name(date);
            let file = OpenOptions::new().create(true).append(true).open(&name)?;
            log::debug!("pick log now {}", name);
            self.writer = Some(BufWriter::new(file));
            self.date = Some(date);
        }
        match self.writer.as_mut() {
            Some(writer) => Ok(writer),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "pick log not open",
            )),
        }
    }

    /// Append `pick`, processed on `date`
    pub fn write(&mut self, pick: &Pick, date: NaiveDate) -> std::io::Result<()> {
        let line = format_pick(pick);
        let writer = self.rotate(date)?;
        writeln!(writer, "{}", line)?;
        writer.flush()
    }
}
