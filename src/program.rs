//! Sentinel rewriting of submitted programs
//!
//! The supervisor learns that a program started and finished by watching two
//! output bit registers that the program itself sets. The start write goes
//! right after the header of the first top-level `def`, the finish write right
//! before that block's closing `end`.

use regex::Regex;
use std::sync::OnceLock;

const INDENT: &str = "  ";

fn block_opener() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(def|thread|if|while|for)\b.*:\s*(#.*)?$").expect("Valid regex")
    })
}

fn def_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^def\s+\w+\s*\(.*\)\s*:\s*(#.*)?$").expect("Valid regex")
    })
}

fn block_end() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*end\s*(#.*)?$").expect("Valid regex"))
}

/// URScript line that sets output bit register `register`
pub fn register_write(register: u32, on: bool) -> String {
    format!(
        "{}write_output_boolean_register({}, {})",
        INDENT,
        register,
        if on { "True" } else { "False" }
    )
}

/// Line range (header, end) of the first top-level `def`, or `None` when the
/// program has no such block or its blocks do not balance
fn main_block(lines: &[&str]) -> Option<(usize, usize)> {
    let mut depth: usize = 0;
    let mut header = None;

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if block_end().is_match(line) {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                if let Some(start) = header {
                    return Some((start, i));
                }
            }
        } else if block_opener().is_match(line) {
            if depth == 0 && header.is_none() && def_header().is_match(trimmed) {
                header = Some(i);
            }
            depth += 1;
        }
    }
    None
}

/// Add the start and finish register writes to `program`
pub fn inject_sentinels(program: &str, start_register: u32, finish_register: u32) -> String {
    let lines: Vec<&str> = program.lines().collect();

    match main_block(&lines) {
        Some((header, end)) => {
            let mut out: Vec<String> = Vec::with_capacity(lines.len() + 2);
            for (i, line) in lines.iter().enumerate() {
                if i == end {
                    out.push(register_write(finish_register, true));
                }
                out.push(line.to_string());
                if i == header {
                    out.push(register_write(start_register, true));
                }
            }
            let mut rewritten = out.join("\n");
            rewritten.push('\n');
            rewritten
        }
        None => wrap_program(program, start_register, finish_register),
    }
}

/// Wrap a program without a usable top-level `def` in one
fn wrap_program(program: &str, start_register: u32, finish_register: u32) -> String {
    let mut out = String::from("def script():\n");
    out.push_str(&register_write(start_register, true));
    out.push('\n');
    for line in program.trim_end_matches(['\n', '\r']).lines() {
        if !line.trim().is_empty() {
            out.push_str(INDENT);
        }
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&register_write(finish_register, true));
    out.push_str("\nend\n");
    out
}

/// Program that clears both sentinel registers
pub fn reset_program(start_register: u32, finish_register: u32) -> String {
    format!(
        "def reset_register():\n{}\n{}\nend\n",
        register_write(start_register, false),
        register_write(finish_register, false)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_def() {
        let program = "def move():\n  movej([0,0,0,0,0,0])\nend";
        assert_eq!(
            inject_sentinels(program, 0, 1),
            "def move():\n  write_output_boolean_register(0, True)\n  movej([0,0,0,0,0,0])\n  write_output_boolean_register(1, True)\nend\n"
        );
    }

    #[test]
    fn test_nested_blocks_are_skipped() {
        let program = "\
def main():
  thread worker():
    while True:
      sleep(0.1)
    end
  end
  if x > 1:
    popup(\"a\")
  elif x < 0:
    popup(\"b\")
  else:
    popup(\"c\")
  end
  sleep(1)
end
";
        let rewritten = inject_sentinels(program, 0, 1);
        let lines: Vec<&str> = rewritten.lines().collect();
        assert_eq!(lines[1], "  write_output_boolean_register(0, True)");
        assert_eq!(lines[lines.len() - 2], "  write_output_boolean_register(1, True)");
        assert_eq!(lines[lines.len() - 1], "end");
        assert_eq!(rewritten.matches("write_output_boolean_register").count(), 2);
    }

    #[test]
    fn test_only_first_top_level_def_is_instrumented() {
        let program = "def helper():\n  return 1\nend\ndef main():\n  helper()\nend\n";
        let rewritten = inject_sentinels(program, 2, 3);
        assert_eq!(
            rewritten,
            "def helper():\n  write_output_boolean_register(2, True)\n  return 1\n  write_output_boolean_register(3, True)\nend\ndef main():\n  helper()\nend\n"
        );
    }

    #[test]
    fn test_plain_commands_are_wrapped() {
        let rewritten = inject_sentinels("movej([0,0,0,0,0,0])\nsleep(1)\n", 0, 1);
        assert_eq!(
            rewritten,
            "def script():\n  write_output_boolean_register(0, True)\n  movej([0,0,0,0,0,0])\n  sleep(1)\n  write_output_boolean_register(1, True)\nend\n"
        );
    }

    #[test]
    fn test_unbalanced_program_is_wrapped() {
        let rewritten = inject_sentinels("def broken():\n  sleep(1)\n", 0, 1);
        assert!(rewritten.starts_with("def script():\n"));
        assert!(rewritten.contains("  def broken():\n"));

        let rewritten = inject_sentinels("end\ndef f():\nend\n", 0, 1);
        assert!(rewritten.starts_with("def script():\n"));
    }

    #[test]
    fn test_reset_program() {
        assert_eq!(
            reset_program(0, 1),
            "def reset_register():\n  write_output_boolean_register(0, False)\n  write_output_boolean_register(1, False)\nend\n"
        );
    }
}
