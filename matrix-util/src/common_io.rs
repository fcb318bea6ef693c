use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;

fn is_gzipped(file: &str) -> bool {
    Path::new(file).extension().and_then(|x| x.to_str()) == Some("gz")
}

/// Lines starting with `#` or `%`, and blank lines, carry no data
fn is_skipped(line: &str) -> bool {
    line.starts_with('#') || line.starts_with('%') || line.trim().is_empty()
}

/// Every line of `input_file` (gzipped or not), in memory
pub fn read_lines(input_file: &str) -> anyhow::Result<Vec<Box<str>>> {
    open_buf_reader(input_file)?
        .lines()
        .map(|x| -> anyhow::Result<Box<str>> { Ok(x?.into_boxed_str()) })
        .collect()
}

/// Parse the data lines of `input_file` in parallel, keeping their
/// order. The first failing line aborts, reported with its line number.
///
/// * `input_file` - file name--either gzipped or not
/// * `parse_fn` - parser of one line
pub fn read_parsed_lines<T, F>(input_file: &str, parse_fn: F) -> anyhow::Result<Vec<T>>
where
    T: Send,
    F: Fn(&str) -> anyhow::Result<T> + Sync,
{
    let lines = read_lines(input_file)?;
    lines
        .par_iter()
        .enumerate()
        .filter(|(_, x)| !is_skipped(x))
        .map(|(i, x)| {
            parse_fn(x).map_err(|e| anyhow::anyhow!("{}:{}: {}", input_file, i + 1, e))
        })
        .collect()
}

/// Write one line per item; `stdout` writes to the terminal, a `.gz`
/// name compresses. A closed pipe ends the output quietly.
pub fn write_lines<T>(lines: &[T], output_file: &str) -> anyhow::Result<()>
where
    T: std::fmt::Display,
{
    let mut buf = open_buf_writer(output_file)?;
    let written = lines
        .iter()
        .try_for_each(|line| writeln!(buf, "{}", line))
        .and_then(|_| buf.flush());

    match written {
        Err(e) if e.kind() != ErrorKind::BrokenPipe => {
            Err(anyhow::anyhow!("failed to write {}: {}", output_file, e))
        }
        _ => Ok(()),
    }
}

/// Buffered reader of a plain or gzipped file
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(input_file)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", input_file, e))?;
    if is_gzipped(input_file) {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Buffered writer to a plain or gzipped file, or to `stdout`
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }
    let file = File::create(output_file)
        .map_err(|e| anyhow::anyhow!("failed to create {}: {}", output_file, e))?;
    if is_gzipped(output_file) {
        Ok(Box::new(BufWriter::new(GzEncoder::new(file, Compression::default()))))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_numbers(s: &str) -> anyhow::Result<Vec<usize>> {
        s.split_whitespace()
            .map(|x| -> anyhow::Result<usize> { Ok(x.parse::<usize>()?) })
            .collect()
    }

    #[test]
    fn gz_lines_survive_write_and_parse() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("lines.txt.gz");
        let file = file.to_str().unwrap();

        let lines = vec!["# comment", "1 2 3", "", "4 5"];
        write_lines(&lines, file)?;
        assert_eq!(read_lines(file)?.len(), 4);

        let parsed = read_parsed_lines(file, parse_numbers)?;
        assert_eq!(parsed, vec![vec![1, 2, 3], vec![4, 5]]);
        Ok(())
    }

    #[test]
    fn parse_errors_carry_the_line_number() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("bad.txt");
        let file = file.to_str().unwrap();

        write_lines(&["1 2", "% skipped", "3 x"], file)?;
        let err = read_parsed_lines(file, parse_numbers).err();
        let msg = err.map(|e| e.to_string()).unwrap_or_default();
        assert!(msg.contains(":3:"), "{}", msg);
        Ok(())
    }
}
