//! SMTP reply parsing.

use crate::error::ClientError;

/// One complete SMTP reply, possibly spanning several `NNN-` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    lines: Vec<String>,
}

impl Response {
    /// Attempts to parse one complete reply from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, or the reply plus the
    /// number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns a parse error for malformed status lines or inconsistent
    /// codes across continuation lines.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, ClientError> {
        let mut consumed = 0;
        let mut code = None;
        let mut lines = Vec::new();

        loop {
            let rest = &buf[consumed..];
            let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let line = &rest[..newline];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            consumed += newline + 1;

            let line = std::str::from_utf8(line)
                .map_err(|err| ClientError::Parse(format!("reply is not valid UTF-8: {err}")))?;
            if line.len() < 3 || !line.is_char_boundary(3) {
                return Err(ClientError::Parse(format!("reply line too short: {line:?}")));
            }
            let line_code: u16 = line[..3]
                .parse()
                .map_err(|_| ClientError::Parse(format!("invalid status code in {line:?}")))?;
            match code {
                None => code = Some(line_code),
                Some(code) if code != line_code => {
                    return Err(ClientError::Parse(format!(
                        "status code changed mid-reply: {code} then {line_code}"
                    )));
                }
                Some(_) => {}
            }

            let (separator, text) = match line.as_bytes().get(3) {
                None => (b' ', ""),
                Some(b' ') => (b' ', &line[4..]),
                Some(b'-') => (b'-', &line[4..]),
                Some(other) => {
                    return Err(ClientError::Parse(format!(
                        "invalid separator {:?} in {line:?}",
                        char::from(*other)
                    )));
                }
            };
            lines.push(text.to_string());

            if separator == b' ' {
                return Ok(Some((
                    Self {
                        code: code.unwrap_or_default(),
                        lines,
                    },
                    consumed,
                )));
            }
        }
    }

    /// Positive completion (2xx).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// Positive intermediate (3xx), e.g. the 354 reply to DATA.
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// The reply text, continuation lines joined with newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// Individual reply lines, one per `NNN-`/`NNN ` row.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Converts a negative reply into the corresponding client error.
    #[must_use]
    pub fn into_error(self) -> ClientError {
        ClientError::Smtp {
            code: self.code,
            message: self.message(),
        }
    }
}
