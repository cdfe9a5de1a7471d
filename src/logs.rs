//! Build and console log plumbing for deploys
//!
//! Each app keeps the build log of its latest deploy and a capped ring
//! buffer of console output from the running instance. During a deploy the
//! console stream is mirrored into the build log, so the build log ends with
//! a bit of app startup output; once the deploy finishes the mirror is
//! detached and console lines only go to the ring buffer.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Maximum retained console lines per app
const CONSOLE_LOG_LINES: usize = 5000;

struct SinkInner {
    build: Mutex<String>,
    console: Mutex<VecDeque<String>>,
    /// Live subscriber for the currently streaming deploy response, if any
    external: Mutex<Option<UnboundedSender<String>>>,
    console_mirrored: AtomicBool,
}

/// Cloneable handle through which git, builds and app processes emit lines
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SinkInner {
                build: Mutex::new(String::new()),
                console: Mutex::new(VecDeque::new()),
                external: Mutex::new(None),
                console_mirrored: AtomicBool::new(false),
            }),
        }
    }

    /// Clear both logs and attach an optional live subscriber for the deploy
    /// that is about to run. Console mirroring is (re)enabled.
    pub fn reset(&self, external: Option<UnboundedSender<String>>) {
        self.inner.build.lock().clear();
        self.inner.console.lock().clear();
        *self.inner.external.lock() = external;
        self.inner.console_mirrored.store(true, Ordering::SeqCst);
    }

    /// Record a build-phase line
    pub fn build_line(&self, line: &str) {
        {
            let mut build = self.inner.build.lock();
            build.push_str(line);
            build.push('\n');
        }
        if let Some(tx) = self.inner.external.lock().as_ref() {
            // A dropped subscriber is fine; the deploy carries on
            let _ = tx.send(format!("{}\n", line));
        }
    }

    /// Record a console line from the running instance
    pub fn console_line(&self, line: &str) {
        if self.inner.console_mirrored.load(Ordering::SeqCst) {
            self.build_line(line.trim_end_matches(['\r', '\n']));
        }
        let mut console = self.inner.console.lock();
        if console.len() == CONSOLE_LOG_LINES {
            console.pop_front();
        }
        console.push_back(line.to_string());
    }

    /// Stop mirroring console output into the build log and drop the live
    /// subscriber. Called when a deploy finishes, either way.
    pub fn detach(&self) {
        self.inner.console_mirrored.store(false, Ordering::SeqCst);
        *self.inner.external.lock() = None;
    }

    pub fn build_log(&self) -> String {
        self.inner.build.lock().clone()
    }

    pub fn console_log(&self) -> String {
        let console = self.inner.console.lock();
        let mut out = String::new();
        for line in console.iter() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}
