/*
 * Whisper Bridge - Rust Edition
 * Copyright (c) 2025 Whisper Bridge Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::Result;
use async_trait::async_trait;
use colored::*;
use std::io::{self, Write};

/// The embedding text surface: accepts a finalized UTF-8 string.
#[async_trait]
pub trait TextSink: Send + Sync {
    async fn insert(&self, text: &str) -> Result<()>;
}

/// Terminal stand-in for the real insertion surface.
pub struct TerminalUI;

impl TerminalUI {
    pub fn new() -> Self {
        Self
    }

    pub fn print_status(&self, message: &str) {
        println!("{} {}", "ℹ️".blue(), message);
    }

    pub fn print_warning(&self, message: &str) {
        println!("{} {}", "⚠️".yellow(), message.yellow());
    }

    pub fn print_error(&self, message: &str) {
        println!("{} {}", "❌".red(), message.red());
    }

    /// Overwrite the current line with an in-flight partial transcript.
    pub fn print_partial(&self, text: &str) {
        print!("\r{} {}", "…".dimmed(), text.dimmed());
        let _ = io::stdout().flush();
    }

    pub fn print_final(&self, text: &str) {
        println!("\r{} {}", "✅".green(), text.bold());
    }
}

impl Default for TerminalUI {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextSink for TerminalUI {
    async fn insert(&self, text: &str) -> Result<()> {
        println!("{} {}", "📝".green(), text);
        Ok(())
    }
}
