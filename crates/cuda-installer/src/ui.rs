//! Console output helpers.
//!
//! Everything here writes for a human watching a terminal, often over a serial
//! console or SSH session, so symbols stay single-width.

use colored::Colorize;
use image_builder::Resource;

const RULE_WIDTH: usize = 60;

/// Section header for a command.
pub fn print_section(title: &str) {
    let rule = "─".repeat(RULE_WIDTH);
    println!();
    println!("{}", rule.bright_black());
    println!(" {}", title.cyan().bold());
    println!("{}", rule.bright_black());
}

pub fn print_step(message: &str) {
    println!("{} {}", "▶".cyan(), message.bold());
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

pub fn print_warning(message: &str) {
    println!("{} {}", "!".yellow().bold(), message.yellow());
}

/// Errors go to stderr so `--json` output stays parseable.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

pub fn print_info(message: &str) {
    println!("{} {}", "i".blue().bold(), message);
}

/// Aligned `key: value` line for state summaries.
pub fn print_kv(key: &str, value: &str) {
    println!("  {:<26} {}", format!("{key}:").bright_black(), value.green());
}

/// One line of a verification report.
pub fn print_check_result(component: &str, present: bool, detail: Option<&str>) {
    let (mark, state) = if present {
        ("✓".green(), "present".green())
    } else {
        ("✗".red(), "missing".red())
    };
    match detail {
        Some(detail) => println!("  {mark} {component:<16} {state} ({detail})"),
        None => println!("  {mark} {component:<16} {state}"),
    }
}

/// Cloud resources a build left behind.
pub fn print_leftovers(resources: &[Resource]) {
    print_warning("These resources still exist and may incur charges:");
    for resource in resources {
        println!("  {} {resource}", "•".bright_black());
    }
}

/// Login command for an interactive build.
pub fn print_ssh_command(command: &str) {
    println!();
    print_info("The build instance is ready for your changes. Connect with:");
    println!("    {}", command.cyan());
    println!();
}
