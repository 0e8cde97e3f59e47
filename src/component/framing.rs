//! XMPP XML framing: incremental stanza extraction from the component stream.
//!
//! The server sends one unbounded XML document (`<stream:stream>` ... `</stream:stream>`).
//! [`FragmentTokenizer`] is fed raw bytes exactly as they come off the transport and
//! yields the stream header once, then every complete top-level stanza as a standalone
//! string. Its state survives across reads, so a stanza may be split over any number of
//! chunks, including in the middle of a multi-byte UTF-8 sequence.
//!
//! Only structural characters are inspected here. Each fragment is parsed on its own
//! afterwards (see [`super::xml::parse_fragment`]), so a malformed stanza can never
//! corrupt the tokenizer.

use thiserror::Error;

/// Maximum size of a single buffered fragment.
///
/// Typical stanzas are a few KB; the largest legitimate ones (vCard avatars, MAM
/// result pages) rarely exceed 100 KB. A peer that never closes a stanza is cut off
/// here instead of growing the buffer without bound.
pub const MAX_FRAGMENT_SIZE: usize = 1_024 * 1_024;

/// Output unit of the tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// The stream header, including the XML declaration if one was sent.
    StreamOpen(String),
    /// A complete top-level element at depth 1 below the stream root.
    Fragment(String),
    /// The peer closed the stream root.
    StreamClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("unexpected byte 0x{found:02x} at stream depth {depth}")]
    UnexpectedByte { found: u8, depth: u32 },
    #[error("fragment exceeded {limit} bytes")]
    FragmentTooLarge { limit: usize },
    #[error("fragment is not valid UTF-8")]
    InvalidUtf8,
    #[error("input after a fatal framing error")]
    Failed,
}

/// Lexical state of the tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    /// Waiting for the `<` of the XML declaration or of the stream tag.
    Start,
    /// Seen the first `<`; `?` means XML declaration, anything else the stream tag.
    StartTag,
    /// Inside the XML declaration.
    Prolog,
    /// Seen `?` inside the XML declaration, `>` ends it.
    PrologEnd,
    /// Declaration done, waiting for the `<` of the stream tag.
    AwaitStreamTag,
    /// Inside the stream tag, waiting for its `>`.
    StreamTag,
    /// Between tags. Text is kept below depth 1, only whitespace is allowed at depth 1.
    Content,
    /// Seen `<` in content.
    TagStart,
    /// Inside `</...`.
    CloseTag,
    /// Inside an opening tag.
    OpenTag,
    /// Inside a quoted attribute value; carries the quote character.
    AttributeValue(u8),
    /// Seen `/` inside an opening tag.
    SelfClosing,
    /// Seen `<!` in content.
    Bang,
    /// Seen `<!-`.
    CommentStart,
    /// Inside `<!-- ... -->`; carries the number of trailing `-` seen, at most 2.
    Comment(u8),
    /// Matching the `CDATA[` keyword after `<![`; carries how much of it matched.
    CdataStart(u8),
    /// Inside `<![CDATA[ ... ]]>`; carries the number of trailing `]` seen, at most 2.
    Cdata(u8),
    /// Inside `<? ... ?>`; true right after a `?`.
    Instruction(bool),
    /// Any other `<!...>` declaration, ended by the first `>`.
    Declaration,
    /// The stream root was closed.
    Closed,
    /// A fatal error occurred; nothing more is accepted.
    Failed,
}

/// Incremental splitter turning the component stream into [`Token`]s.
#[derive(Debug)]
pub struct FragmentTokenizer {
    state: ParserState,
    depth: u32,
    stream_quote: Option<u8>,
    buffer: Vec<u8>,
    max_fragment_size: usize,
}

impl Default for FragmentTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

fn is_whitespace(b: u8) -> bool {
    b <= b' '
}

impl FragmentTokenizer {
    pub fn new() -> Self {
        Self::with_max_fragment_size(MAX_FRAGMENT_SIZE)
    }

    pub fn with_max_fragment_size(max_fragment_size: usize) -> Self {
        Self {
            state: ParserState::Start,
            depth: 0,
            stream_quote: None,
            buffer: Vec::new(),
            max_fragment_size,
        }
    }

    /// Current element nesting depth; 1 means "directly inside the stream root".
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_failed(&self) -> bool {
        self.state == ParserState::Failed
    }

    /// Feed one chunk of transport data.
    ///
    /// Tokens completed by this chunk are appended to `out`. On error, the tokens that
    /// were completed before the offending byte are still in `out`, and the tokenizer
    /// stays failed for good.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Token>) -> Result<(), FramingError> {
        if self.state == ParserState::Failed {
            return Err(FramingError::Failed);
        }
        for &b in chunk {
            if let Some(token) = self.step(b)? {
                out.push(token);
            }
        }
        Ok(())
    }

    fn step(&mut self, b: u8) -> Result<Option<Token>, FramingError> {
        match self.state {
            ParserState::Start => {
                if b == b'<' {
                    self.push(b)?;
                    self.state = ParserState::StartTag;
                } else if !is_whitespace(b) {
                    return Err(self.fail(b));
                }
            }
            ParserState::StartTag => {
                if b == b'>' || is_whitespace(b) {
                    return Err(self.fail(b));
                }
                self.push(b)?;
                self.state = if b == b'?' {
                    ParserState::Prolog
                } else {
                    ParserState::StreamTag
                };
            }
            ParserState::Prolog => {
                self.push(b)?;
                if b == b'?' {
                    self.state = ParserState::PrologEnd;
                }
            }
            ParserState::PrologEnd => {
                self.push(b)?;
                self.state = match b {
                    b'>' => ParserState::AwaitStreamTag,
                    b'?' => ParserState::PrologEnd,
                    _ => ParserState::Prolog,
                };
            }
            ParserState::AwaitStreamTag => {
                if b == b'<' {
                    self.push(b)?;
                    self.state = ParserState::StreamTag;
                } else if is_whitespace(b) {
                    self.push(b)?;
                } else {
                    return Err(self.fail(b));
                }
            }
            ParserState::StreamTag => {
                self.push(b)?;
                match self.stream_quote {
                    Some(q) if q == b => self.stream_quote = None,
                    Some(_) => {}
                    None if b == b'\'' || b == b'"' => self.stream_quote = Some(b),
                    None if b == b'>' => {
                        self.depth = 1;
                        self.state = ParserState::Content;
                        return self.take().map(|xml| Some(Token::StreamOpen(xml)));
                    }
                    None => {}
                }
            }
            ParserState::Content => {
                if b == b'<' {
                    self.push(b)?;
                    self.state = ParserState::TagStart;
                } else if self.depth > 1 {
                    self.push(b)?;
                } else if !is_whitespace(b) {
                    return Err(self.fail(b));
                }
            }
            ParserState::TagStart => {
                if b == b'>' || is_whitespace(b) {
                    return Err(self.fail(b));
                }
                self.push(b)?;
                self.state = match b {
                    b'/' => ParserState::CloseTag,
                    b'!' => ParserState::Bang,
                    b'?' => ParserState::Instruction(false),
                    _ => ParserState::OpenTag,
                };
            }
            ParserState::CloseTag => {
                self.push(b)?;
                if b == b'>' {
                    self.depth -= 1;
                    if self.depth == 0 {
                        self.buffer.clear();
                        self.state = ParserState::Closed;
                        return Ok(Some(Token::StreamClosed));
                    }
                    self.state = ParserState::Content;
                    if self.depth == 1 {
                        return self.take().map(|xml| Some(Token::Fragment(xml)));
                    }
                }
            }
            ParserState::OpenTag => return self.open_tag_byte(b),
            ParserState::AttributeValue(q) => {
                self.push(b)?;
                if b == q {
                    self.state = ParserState::OpenTag;
                }
            }
            ParserState::SelfClosing => {
                if b == b'>' {
                    self.push(b)?;
                    self.state = ParserState::Content;
                    if self.depth == 1 {
                        return self.take().map(|xml| Some(Token::Fragment(xml)));
                    }
                } else {
                    self.state = ParserState::OpenTag;
                    return self.open_tag_byte(b);
                }
            }
            ParserState::Bang => {
                self.push(b)?;
                self.state = match b {
                    b'-' => ParserState::CommentStart,
                    b'[' if self.depth == 1 => return Err(self.fail(b)),
                    b'[' => ParserState::CdataStart(0),
                    b'>' => return Ok(self.end_markup()),
                    _ => ParserState::Declaration,
                };
            }
            ParserState::CommentStart => {
                self.push(b)?;
                self.state = match b {
                    b'-' => ParserState::Comment(0),
                    b'>' => return Ok(self.end_markup()),
                    _ => ParserState::Declaration,
                };
            }
            ParserState::Comment(dashes) => {
                self.push(b)?;
                self.state = match b {
                    b'>' if dashes == 2 => return Ok(self.end_markup()),
                    b'-' => ParserState::Comment((dashes + 1).min(2)),
                    _ => ParserState::Comment(0),
                };
            }
            ParserState::CdataStart(matched) => {
                self.push(b)?;
                let keyword = b"CDATA[";
                self.state = if b == keyword[matched as usize] {
                    if matched as usize + 1 == keyword.len() {
                        ParserState::Cdata(0)
                    } else {
                        ParserState::CdataStart(matched + 1)
                    }
                } else if b == b'>' {
                    return Ok(self.end_markup());
                } else {
                    ParserState::Declaration
                };
            }
            ParserState::Cdata(brackets) => {
                self.push(b)?;
                self.state = match b {
                    b'>' if brackets == 2 => return Ok(self.end_markup()),
                    b']' => ParserState::Cdata((brackets + 1).min(2)),
                    _ => ParserState::Cdata(0),
                };
            }
            ParserState::Instruction(question) => {
                self.push(b)?;
                self.state = match b {
                    b'>' if question => return Ok(self.end_markup()),
                    b'?' => ParserState::Instruction(true),
                    _ => ParserState::Instruction(false),
                };
            }
            ParserState::Declaration => {
                self.push(b)?;
                if b == b'>' {
                    return Ok(self.end_markup());
                }
            }
            ParserState::Closed => {
                if !is_whitespace(b) {
                    return Err(self.fail(b));
                }
            }
            ParserState::Failed => return Err(FramingError::Failed),
        }
        Ok(None)
    }

    /// Markup is kept inside a fragment and dropped at stream level.
    fn end_markup(&mut self) -> Option<Token> {
        if self.depth == 1 {
            self.buffer.clear();
        }
        self.state = ParserState::Content;
        None
    }

    fn open_tag_byte(&mut self, b: u8) -> Result<Option<Token>, FramingError> {
        self.push(b)?;
        match b {
            b'\'' | b'"' => self.state = ParserState::AttributeValue(b),
            b'/' => self.state = ParserState::SelfClosing,
            b'>' => {
                self.depth += 1;
                self.state = ParserState::Content;
            }
            _ => {}
        }
        Ok(None)
    }

    fn push(&mut self, b: u8) -> Result<(), FramingError> {
        if self.buffer.len() >= self.max_fragment_size {
            self.state = ParserState::Failed;
            self.buffer.clear();
            return Err(FramingError::FragmentTooLarge {
                limit: self.max_fragment_size,
            });
        }
        self.buffer.push(b);
        Ok(())
    }

    fn take(&mut self) -> Result<String, FramingError> {
        let bytes = std::mem::take(&mut self.buffer);
        String::from_utf8(bytes).map_err(|_| {
            self.state = ParserState::Failed;
            FramingError::InvalidUtf8
        })
    }

    fn fail(&mut self, found: u8) -> FramingError {
        self.state = ParserState::Failed;
        self.buffer.clear();
        FramingError::UnexpectedByte {
            found,
            depth: self.depth,
        }
    }
}
