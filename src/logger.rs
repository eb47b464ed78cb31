use crate::config::LoggingConfig;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::env::var;
use std::fs::create_dir_all;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const MAX_LOG_LINES: usize = 20000;

// Harvested credentials flow through the engine, keep them out of the buffer
const SENSITIVE_KEYWORDS: [&str; 6] = ["password", "pass", "value", "key", "secret", "token"];

lazy_static! {
    static ref MEMORY_DATA: Arc<Mutex<MemoryWriterData>> =
        Arc::new(Mutex::new(MemoryWriterData::new()));
}

static SUBSCRIBER_INSTALLED: AtomicBool = AtomicBool::new(false);

fn keyword_regex(keyword: &str) -> Option<Regex> {
    Regex::new(&format!(
        r#"(?P<key>"?(\b{})"?\s*[:=]?\s*)("(?P<val1>[^"]+)"|(?P<val2>\b[^\s",}}]+))"#,
        regex::escape(keyword)
    ))
    .ok()
}

fn mask(re: &Regex, input: &str) -> String {
    re.replace_all(input, |caps: &regex::Captures| {
        let key = &caps["key"];
        let val1 = caps.name("val1").map_or("", |m| m.as_str());
        let val2 = caps.name("val2").map_or("", |m| m.as_str());
        let val = if !val1.is_empty() { val1 } else { val2 };
        let quotes = if !val1.is_empty() { "\"" } else { "" };

        format!("{}{}{}{}", key, quotes, "*".repeat(val.len()), quotes)
    })
    .to_string()
}

pub struct MemoryWriterData {
    logs: VecDeque<String>,
    to_take: usize,
}

impl MemoryWriterData {
    pub fn new() -> Self {
        Self {
            logs: VecDeque::new(),
            to_take: 0,
        }
    }
}

impl Default for MemoryWriterData {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory ring buffer of formatted log lines, newest first. Values
/// following any of the writer's keywords are masked before storage.
#[derive(Clone)]
pub struct MemoryWriter {
    data: Arc<Mutex<MemoryWriterData>>,
    keywords: Arc<Vec<Regex>>,
}

impl MemoryWriter {
    pub fn new(data: Arc<Mutex<MemoryWriterData>>) -> Self {
        Self::with_keywords(data, &SENSITIVE_KEYWORDS)
    }

    pub fn with_keywords(data: Arc<Mutex<MemoryWriterData>>, keywords: &[&str]) -> Self {
        let keywords = keywords
            .iter()
            .filter_map(|keyword| keyword_regex(keyword))
            .collect();
        Self {
            data,
            keywords: Arc::new(keywords),
        }
    }

    fn sanitize_keywords(&self, input: &str) -> String {
        self.keywords
            .iter()
            .fold(input.to_string(), |acc, re| mask(re, &acc))
    }

    fn push_line(&self, line: &str) {
        let sanitized = self.sanitize_keywords(line);
        let mut locked_data = self.data.lock();

        // If we have more than MAX_LOG_LINES, remove the oldest one
        if locked_data.logs.len() >= MAX_LOG_LINES {
            locked_data.logs.pop_back();
        }
        locked_data.logs.push_front(sanitized);
        if locked_data.to_take < MAX_LOG_LINES {
            locked_data.to_take += 1;
        }
    }
}

impl io::Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            self.push_line(line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for MemoryWriter {
    type Writer = MemoryWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

pub struct FoundationLogger {
    memory_writer_data: Arc<Mutex<MemoryWriterData>>,
    // Flushes the file appender on drop
    _file_guard: Option<WorkerGuard>,
}

impl FoundationLogger {
    fn new(config: &LoggingConfig) -> Self {
        let memory_writer_data = MEMORY_DATA.clone();
        if SUBSCRIBER_INSTALLED.swap(true, Ordering::SeqCst) {
            return Self {
                memory_writer_data,
                _file_guard: None,
            };
        }

        let level = var("SNAILSHELL_LOG_LEVEL").unwrap_or_else(|_| config.level.clone());
        let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

        let memory_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(MemoryWriter::new(memory_writer_data.clone()));

        let mut file_error = None;
        let (file_layer, file_guard) = match &config.directory {
            Some(dir) => match create_dir_all(dir) {
                Ok(_) => {
                    let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
                    let (writer, guard) = tracing_appender::non_blocking(appender);
                    (
                        Some(fmt::layer().with_ansi(false).with_writer(writer)),
                        Some(guard),
                    )
                }
                Err(e) => {
                    file_error = Some(format!("{}: {}", dir.display(), e));
                    (None, None)
                }
            },
            None => (None, None),
        };

        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .with(memory_layer)
            .with(file_layer)
            .try_init();

        match installed {
            Ok(_) => info!("Logger initialized at level {}", level),
            Err(e) => warn!("A global subscriber was already installed: {}", e),
        }
        if let Some(e) = file_error {
            warn!("File logging disabled, could not create {}", e);
        }

        Self {
            memory_writer_data,
            _file_guard: file_guard,
        }
    }

    /// Lines logged since the previous call, newest first.
    pub fn get_new_logs(&self) -> String {
        let mut locked_data = self.memory_writer_data.lock();
        let new_logs: String = locked_data
            .logs
            .iter()
            .take(locked_data.to_take)
            .fold(String::new(), |acc, x| format!("{}\n{}", acc, x));
        locked_data.to_take = 0;
        new_logs
    }

    pub fn get_all_logs(&self) -> String {
        let locked_data = self.memory_writer_data.lock();
        locked_data
            .logs
            .iter()
            .fold(String::new(), |acc, x| format!("{}\n{}", acc, x))
    }
}

/// Installs the global subscriber on first call. Later calls only hand out
/// another view on the shared memory buffer.
pub fn init_logger(config: &LoggingConfig) -> FoundationLogger {
    FoundationLogger::new(config)
}
