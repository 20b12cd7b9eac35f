use std::io;

/// Builder for INI-style descriptor text (systemd units and drop-in fragments).
///
/// Invariants:
/// - No pushed key, value, comment, or section name may contain `\n`, `\r`, or `\0`;
///   a value with an embedded newline could smuggle extra directives into the unit.
/// - Sections are separated by one blank line; `build()` ends with a single `\n`.
#[derive(Debug, Default)]
pub struct IniText {
    lines: Vec<String>,
}

impl IniText {
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }

    pub fn section(&mut self, name: &str) -> &mut Self {
        if !self.lines.is_empty() {
            self.lines.push(String::new());
        }
        self.lines.push(format!("[{name}]"));
        self
    }

    pub fn comment(&mut self, text: &str) -> &mut Self {
        self.lines.push(format!("# {text}"));
        self
    }

    pub fn kv(&mut self, key: &str, value: impl std::fmt::Display) -> &mut Self {
        self.lines.push(format!("{key}={value}"));
        self
    }

    pub fn build(&self) -> io::Result<String> {
        for (i, l) in self.lines.iter().enumerate() {
            if l.contains('\n') || l.contains('\r') || l.contains('\0') {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("descriptor line {i} contains a newline or NUL"),
                ));
            }
        }
        if self.lines.is_empty() {
            return Ok(String::new());
        }
        let mut out = self.lines.join("\n");
        out.push('\n');
        Ok(out)
    }
}
