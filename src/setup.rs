/// Interactive setup: asks for each setting on the terminal before the run.
///
/// The current value is shown in parentheses and kept when the answer is
/// empty. Skipped entirely with `--skip-setup`.
use crate::config::GuardConfig;
use std::fmt::Display;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;

/// Prompt for every setting, updating `config` in place.
///
/// End of input keeps the remaining values as they are.
pub fn collect<R: BufRead, W: Write>(
    config: &mut GuardConfig,
    mut input: R,
    mut output: W,
) -> io::Result<()> {
    writeln!(
        output,
        "Press Enter to keep the value shown in parentheses."
    )?;

    ask_path(
        &mut input,
        &mut output,
        "Render executable",
        &mut config.render.executable,
    )?;
    ask_path(
        &mut input,
        &mut output,
        "Project file",
        &mut config.render.project_file,
    )?;
    ask_path(
        &mut input,
        &mut output,
        "Render output directory",
        &mut config.output.dir,
    )?;
    if let Some(ext) = ask(&mut input, &mut output, "Output extension", &config.output.extension)? {
        config.output.extension = ext;
    }
    ask_number(
        &mut input,
        &mut output,
        "End frame",
        &mut config.render.end_frame,
    )?;
    ask_number(
        &mut input,
        &mut output,
        "Time limit per frame (seconds)",
        &mut config.watchdog.time_limit_secs,
    )?;

    Ok(())
}

/// Print one prompt and read one line. `None` for an empty answer or EOF.
fn ask<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    label: &str,
    current: &dyn Display,
) -> io::Result<Option<String>> {
    write!(output, "{label} ({current}): ")?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    let answer = line.trim();
    if answer.is_empty() {
        Ok(None)
    } else {
        Ok(Some(answer.to_string()))
    }
}

fn ask_path<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    label: &str,
    value: &mut PathBuf,
) -> io::Result<()> {
    if let Some(answer) = ask(input, output, label, &value.display())? {
        *value = PathBuf::from(answer);
    }
    Ok(())
}

fn ask_number<T, R, W>(input: &mut R, output: &mut W, label: &str, value: &mut T) -> io::Result<()>
where
    T: FromStr + Display,
    R: BufRead,
    W: Write,
{
    if let Some(answer) = ask(input, output, label, &*value)? {
        match answer.parse() {
            Ok(parsed) => *value = parsed,
            Err(_) => writeln!(output, "'{answer}' is not a valid number, keeping {value}")?,
        }
    }
    Ok(())
}
