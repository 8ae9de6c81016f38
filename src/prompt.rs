use std::io::{BufRead, Stdin, StdinLock, Stdout, Write};

pub const CONFIRMATION_PROMPT: &str = "Continuer quand même? (o/n): ";

/// Asks the operator whether to continue with randomly initialized weights.
pub trait ConfirmationProvider {
    fn confirm(&mut self, prompt: &str) -> std::io::Result<bool>;
}

/// Only `o` counts as yes, ignoring case and surrounding whitespace.
pub fn is_affirmative(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("o")
}

/// Prints the prompt and reads one line. End of input counts as a refusal.
pub struct LineConfirmation<R, W> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> LineConfirmation<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl LineConfirmation<StdinLock<'static>, Stdout> {
    pub fn stdin() -> Self {
        let stdin: Stdin = std::io::stdin();
        Self::new(stdin.lock(), std::io::stdout())
    }
}

impl<R: BufRead, W: Write> ConfirmationProvider for LineConfirmation<R, W> {
    fn confirm(&mut self, prompt: &str) -> std::io::Result<bool> {
        write!(self.writer, "\n{prompt}")?;
        self.writer.flush()?;
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            writeln!(self.writer)?;
            return Ok(false);
        }
        Ok(is_affirmative(&line))
    }
}

/// Answers every prompt the same way, for unattended runs (`--yes`) and tests.
pub struct FixedAnswer {
    answer: String,
    asked: usize,
}

impl FixedAnswer {
    pub fn new(answer: &str) -> Self {
        Self { answer: answer.to_string(), asked: 0 }
    }

    pub fn yes() -> Self {
        Self::new("o")
    }

    pub fn times_asked(&self) -> usize {
        self.asked
    }
}

impl ConfirmationProvider for FixedAnswer {
    fn confirm(&mut self, prompt: &str) -> std::io::Result<bool> {
        self.asked += 1;
        log::info!("{}{}", prompt, self.answer);
        Ok(is_affirmative(&self.answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_o_is_affirmative() {
        assert!(is_affirmative("o"));
        assert!(is_affirmative("O"));
        assert!(is_affirmative("  o\n"));
        assert!(!is_affirmative("oui"));
        assert!(!is_affirmative("y"));
        assert!(!is_affirmative(""));
    }

    #[test]
    fn test_line_confirmation_reads_one_answer() {
        let mut out = vec![];
        let mut confirmation = LineConfirmation::new("O\nn\n".as_bytes(), &mut out);
        assert!(confirmation.confirm(CONFIRMATION_PROMPT).unwrap());
        assert!(!confirmation.confirm(CONFIRMATION_PROMPT).unwrap());
        let printed = String::from_utf8(out).unwrap();
        assert_eq!(printed, format!("\n{CONFIRMATION_PROMPT}\n{CONFIRMATION_PROMPT}"));
    }

    #[test]
    fn test_end_of_input_declines() {
        let mut confirmation = LineConfirmation::new("".as_bytes(), std::io::sink());
        assert!(!confirmation.confirm(CONFIRMATION_PROMPT).unwrap());
    }

    #[test]
    fn test_fixed_answer_counts_prompts() {
        let mut answer = FixedAnswer::new("n");
        assert!(!answer.confirm(CONFIRMATION_PROMPT).unwrap());
        assert_eq!(answer.times_asked(), 1);
    }
}
