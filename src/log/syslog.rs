use std::fmt;

use super::{Level, Log};
use crate::system::syslog;

/// Longest message body sent in a single syslog call; longer messages are split on whitespace.
const LIMIT: usize = 960;

pub struct Syslog;

impl Log for Syslog {
    fn log(&self, level: Level, args: &fmt::Arguments<'_>) {
        let priority = match level {
            Level::Error => libc::LOG_ERR,
            Level::Warn => libc::LOG_WARNING,
            Level::Info => libc::LOG_INFO,
            Level::Debug => libc::LOG_DEBUG,
            Level::Trace => libc::LOG_DEBUG,
        };

        for chunk in split_message(&args.to_string()) {
            syslog(priority, libc::LOG_AUTH, &chunk);
        }
    }

    fn flush(&self) {
        // pass
    }
}

/// Split a message in chunks of at most `LIMIT` bytes, cutting at whitespace where possible and
/// marking continuations with `[...]`.
fn split_message(message: &str) -> Vec<String> {
    if message.len() <= LIMIT {
        return vec![message.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = message;

    while !rest.is_empty() {
        let mut end = rest.len().min(LIMIT);
        // floor_char_boundary is currently unstable
        while !rest.is_char_boundary(end) {
            end -= 1;
        }

        if end < rest.len() {
            if let Some(space) = rest[..end].rfind(char::is_whitespace) {
                if space > 0 {
                    end = space + 1;
                }
            }
        }

        let (head, tail) = rest.split_at(end);
        let mut chunk = String::with_capacity(head.len() + 12);
        if !chunks.is_empty() {
            chunk.push_str("[...] ");
        }
        chunk.push_str(head);
        if !tail.is_empty() {
            chunk.push_str("[...]");
        }
        chunks.push(chunk);
        rest = tail;
    }

    chunks
}
