use crate::core::Mode;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("block {block}: {reason}")]
    MalformedBlock { block: usize, reason: String },
    #[error("block {block}: missing required {field} line")]
    MissingRequiredField { block: usize, field: &'static str },
    #[error("block {block}: expected an integer for {field}, got {line:?}")]
    NonIntegerWhereExpected {
        block: usize,
        field: &'static str,
        line: String,
    },
}

/// One parsed task block, in file order. `gpu_count` is `None` in single
/// mode and at least 1 in multi mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub queue_id: u32,
    pub gpu_count: Option<u32>,
    pub memory_gb: u64,
    pub commands: Vec<String>,
}

/// Parse a command file. Blocks are separated by one or more blank lines;
/// `#`-prefixed lines are comments. Within a block:
///
/// - line 1: queue id
/// - middle lines: one shell command each, passed verbatim
/// - multi mode: second-to-last line is the gpu count
/// - last line: required free memory per device, in GiB
///
/// Integer lines accept a trailing `# comment`; only the leading numeric
/// token is read.
pub fn parse_command_file(content: &str, mode: Mode) -> Result<Vec<TaskSpec>, ParseError> {
    let mut specs = Vec::new();

    for (index, lines) in blocks(content).into_iter().enumerate() {
        let min_lines = match mode {
            Mode::Single => 3,
            Mode::Multi => 4,
        };
        if lines.len() < 2 {
            return Err(ParseError::MalformedBlock {
                block: index,
                reason: format!("only {} non-comment line(s)", lines.len()),
            });
        }
        if lines.len() < min_lines {
            let field = match mode {
                Mode::Single => "command",
                Mode::Multi if lines.len() == 2 => "gpu_count",
                Mode::Multi => "command",
            };
            return Err(ParseError::MissingRequiredField {
                block: index,
                field,
            });
        }

        let queue_id = parse_integer(&lines[0], index, "queue id")?;
        let memory_gb = parse_integer(lines.last().unwrap(), index, "memory_gb")? as u64;

        let (gpu_count, commands) = match mode {
            Mode::Single => (None, lines[1..lines.len() - 1].to_vec()),
            Mode::Multi => {
                let count = parse_integer(&lines[lines.len() - 2], index, "gpu_count")?;
                if count == 0 {
                    return Err(ParseError::MalformedBlock {
                        block: index,
                        reason: "gpu_count must be at least 1".into(),
                    });
                }
                (Some(count), lines[1..lines.len() - 2].to_vec())
            }
        };

        specs.push(TaskSpec {
            queue_id,
            gpu_count,
            memory_gb,
            commands,
        });
    }

    Ok(specs)
}

/// Split into blocks of trimmed, non-comment lines. Comment-only blocks
/// vanish entirely.
fn blocks(content: &str) -> Vec<Vec<String>> {
    let mut out = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        current.push(line.to_string());
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn parse_integer(line: &str, block: usize, field: &'static str) -> Result<u32, ParseError> {
    let stripped = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    stripped
        .split_whitespace()
        .next()
        .and_then(|token| token.parse::<u32>().ok())
        .ok_or_else(|| ParseError::NonIntegerWhereExpected {
            block,
            field,
            line: line.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_mode_block() {
        let content = "\
1
python train.py --run a
python eval.py --run a
20
";
        let specs = parse_command_file(content, Mode::Single).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].queue_id, 1);
        assert_eq!(specs[0].memory_gb, 20);
        assert_eq!(specs[0].gpu_count, None);
        assert_eq!(
            specs[0].commands,
            vec!["python train.py --run a", "python eval.py --run a"]
        );
    }

    #[test]
    fn multi_mode_block_with_comments() {
        let content = "\
# fine-tune sweep
2  # queue two
torchrun --nproc_per_node=4 train.py
4  # gpus
40 # GiB per device
";
        let specs = parse_command_file(content, Mode::Multi).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].queue_id, 2);
        assert_eq!(specs[0].gpu_count, Some(4));
        assert_eq!(specs[0].memory_gb, 40);
        assert_eq!(specs[0].commands, vec!["torchrun --nproc_per_node=4 train.py"]);
    }

    #[test]
    fn blank_lines_delimit_blocks_in_file_order() {
        let content = "\
1
echo first
10


2
echo second
12

1
echo third
10
";
        let specs = parse_command_file(content, Mode::Single).unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].commands, vec!["echo first"]);
        assert_eq!(specs[1].queue_id, 2);
        // Same queue id later in the file keeps its position.
        assert_eq!(specs[2].queue_id, 1);
        assert_eq!(specs[2].commands, vec!["echo third"]);
    }

    #[test]
    fn comment_only_blocks_are_skipped() {
        let content = "# just notes\n# more notes\n\n1\necho hi\n8\n";
        let specs = parse_command_file(content, Mode::Single).unwrap();
        assert_eq!(specs.len(), 1);
    }

    #[test]
    fn commands_pass_through_verbatim() {
        let content = "1\npython run.py --out {work_dir}/out 2>&1 | tee log\n16\n";
        let specs = parse_command_file(content, Mode::Single).unwrap();
        assert_eq!(
            specs[0].commands[0],
            "python run.py --out {work_dir}/out 2>&1 | tee log"
        );
    }

    #[test]
    fn one_line_block_is_malformed() {
        let err = parse_command_file("42\n", Mode::Single).unwrap_err();
        assert!(matches!(err, ParseError::MalformedBlock { block: 0, .. }));
    }

    #[test]
    fn single_block_without_command_is_missing_field() {
        let err = parse_command_file("1\n20\n", Mode::Single).unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingRequiredField {
                block: 0,
                field: "command"
            }
        );
    }

    #[test]
    fn multi_block_without_gpu_count_is_missing_field() {
        let err = parse_command_file("1\n20\n", Mode::Multi).unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingRequiredField {
                block: 0,
                field: "gpu_count"
            }
        );
    }

    #[test]
    fn non_integer_queue_id() {
        let err = parse_command_file("queue-a\necho hi\n20\n", Mode::Single).unwrap_err();
        assert!(matches!(
            err,
            ParseError::NonIntegerWhereExpected {
                block: 0,
                field: "queue id",
                ..
            }
        ));
    }

    #[test]
    fn zero_gpu_count_is_rejected() {
        let err = parse_command_file("1\necho hi\n0\n20\n", Mode::Multi).unwrap_err();
        assert!(matches!(err, ParseError::MalformedBlock { block: 0, .. }));
    }

    #[test]
    fn second_bad_block_reports_its_index() {
        let content = "1\necho ok\n20\n\n2\necho bad\nmany\n";
        let err = parse_command_file(content, Mode::Single).unwrap_err();
        assert!(matches!(
            err,
            ParseError::NonIntegerWhereExpected { block: 1, .. }
        ));
    }
}
