//! Installing the log sink.
//!
//! Small setups log straight to stdout through `simple_logger`. Otherwise records are formatted on
//! the calling thread and queued for a writer thread that appends them to rolling files, so a
//! worker never waits on the disk unless the queue is full.
//!
//! Files are named after the local date, `2024_05_01.log`. A file that reaches `MAX_LINES` lines
//! continues in `2024_05_01-1.log` and so on, and a new day starts a new file.

use chrono::{Local, NaiveDate};

use log::{self, LevelFilter, Log, Metadata, Record};

use simple_logger;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use config::LogConfig;
use error::Result;

/// Lines written to one file before moving on to the next.
pub const MAX_LINES: usize = 50_000;

/// Install the logger described by the config.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = config.level_filter()?;
    let level = match filter.to_level() {
        Some(level) if config.enabled => level,
        _ => {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }
    };

    if config.queue_depth == 0 {
        simple_logger::init_with_level(level)?;
        return Ok(());
    }

    let logger = AsyncLog::new(&config.dir, filter, config.queue_depth)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(filter);
    Ok(())
}

enum Command {
    Line(String),
    Flush(SyncSender<()>),
}

/// The file currently being appended to.
struct Sink {
    dir: PathBuf,
    out: BufWriter<File>,
    day: NaiveDate,
    lines: usize,
    max_lines: usize,
    rolled: usize,
}

impl Sink {
    fn open(dir: &Path, max_lines: usize, day: NaiveDate) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let out = BufWriter::new(append(&dir.join(file_name(day, 0)))?);
        Ok(Sink {
            dir: dir.to_path_buf(),
            out,
            day,
            lines: 0,
            max_lines,
            rolled: 0,
        })
    }

    fn write_line(&mut self, line: &str, day: NaiveDate) -> io::Result<()> {
        if day != self.day {
            self.switch(day, 0)?;
        } else if self.lines >= self.max_lines {
            let rolled = self.rolled + 1;
            self.switch(day, rolled)?;
        }
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    fn switch(&mut self, day: NaiveDate, rolled: usize) -> io::Result<()> {
        self.out.flush()?;
        self.out = BufWriter::new(append(&self.dir.join(file_name(day, rolled)))?);
        self.day = day;
        self.rolled = rolled;
        self.lines = 0;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

fn today() -> NaiveDate {
    Local::now().naive_local().date()
}

/// `2024_05_01.log`, then `2024_05_01-1.log` once the first file is full.
fn file_name(day: NaiveDate, rolled: usize) -> String {
    let date = day.format("%Y_%m_%d");
    if rolled == 0 {
        format!("{}.log", date)
    } else {
        format!("{}-{}.log", date, rolled)
    }
}

fn append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// A logger that hands formatted lines to a background writer over a bounded queue.
pub struct AsyncLog {
    level: LevelFilter,
    sender: Mutex<Option<SyncSender<Command>>>,
    sink: Arc<Mutex<Sink>>,
    writer: Option<JoinHandle<()>>,
}

impl AsyncLog {
    pub fn new<P: AsRef<Path>>(dir: P, level: LevelFilter, queue_depth: usize) -> Result<Self> {
        AsyncLog::with_roll(dir, level, queue_depth, MAX_LINES)
    }

    /// Like `new`, rolling to a new file every `max_lines` lines.
    pub fn with_roll<P: AsRef<Path>>(
        dir: P,
        level: LevelFilter,
        queue_depth: usize,
        max_lines: usize,
    ) -> Result<Self> {
        let sink = Arc::new(Mutex::new(Sink::open(dir.as_ref(), max_lines.max(1), today())?));
        let (sender, receiver) = mpsc::sync_channel(queue_depth);

        let writer_sink = sink.clone();
        let writer = thread::Builder::new()
            .name("log-writer".to_owned())
            .spawn(move || drain(&receiver, &writer_sink))?;

        Ok(AsyncLog {
            level,
            sender: Mutex::new(Some(sender)),
            sink,
            writer: Some(writer),
        })
    }

    fn write_now(&self, line: &str) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.write_line(line, today());
        }
    }
}

fn drain(receiver: &Receiver<Command>, sink: &Mutex<Sink>) {
    for command in receiver.iter() {
        let mut sink = match sink.lock() {
            Ok(sink) => sink,
            Err(_) => return,
        };
        match command {
            Command::Line(line) => {
                if let Err(e) = sink.write_line(&line, today()) {
                    eprintln!("Could not write log line: {}", e);
                }
            }
            Command::Flush(done) => {
                let _ = sink.flush();
                let _ = done.send(());
            }
        }
    }
    if let Ok(mut sink) = sink.lock() {
        let _ = sink.flush();
    }
}

fn render(record: &Record) -> String {
    format!(
        "{} {:<5} [{}] {}",
        Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
        record.level(),
        record.target(),
        record.args()
    )
}

impl Log for AsyncLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = render(record);

        let sender = match self.sender.lock() {
            Ok(sender) => sender.clone(),
            Err(_) => None,
        };
        let sender = match sender {
            Some(sender) => sender,
            None => return self.write_now(&line),
        };

        match sender.try_send(Command::Line(line)) {
            Ok(()) => {}
            // queue full or writer gone: write on this thread instead
            Err(TrySendError::Full(Command::Line(line)))
            | Err(TrySendError::Disconnected(Command::Line(line))) => self.write_now(&line),
            Err(_) => {}
        }
    }

    fn flush(&self) {
        let sender = match self.sender.lock() {
            Ok(sender) => sender.clone(),
            Err(_) => None,
        };
        if let Some(sender) = sender {
            let (done, wait) = mpsc::sync_channel(1);
            if sender.send(Command::Flush(done)).is_ok() {
                let _ = wait.recv();
            }
        }
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.flush();
        }
    }
}

impl Drop for AsyncLog {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}
