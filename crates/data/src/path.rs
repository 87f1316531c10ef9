//! Path expression parsing

use std::fmt;

/// One step of a path expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed path
///
/// Parse once per call and reuse the result for every step of the walk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathExpression {
    segments: Vec<Segment>,
}

impl PathExpression {
    /// Parse a dotted/bracketed path
    ///
    /// Splits on `.`. A segment of the form `name[digits]` becomes
    /// `Key(name)` followed by `Index(digits)`; any other segment is taken
    /// as a literal key. An empty string is the empty path.
    pub fn parse(path: &str) -> Self {
        if path.is_empty() {
            return Self::default();
        }

        let mut segments = Vec::new();
        for part in path.split('.') {
            match split_indexed(part) {
                Some((name, index)) => {
                    segments.push(Segment::Key(name.to_string()));
                    segments.push(Segment::Index(index));
                }
                None => segments.push(Segment::Key(part.to_string())),
            }
        }

        Self { segments }
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }
}

impl fmt::Display for PathExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Key(name) if i == 0 => write!(f, "{}", name)?,
                Segment::Key(name) => write!(f, ".{}", name)?,
                Segment::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

impl From<&str> for PathExpression {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

/// Split `name[digits]` into its parts
fn split_indexed(part: &str) -> Option<(&str, usize)> {
    let body = part.strip_suffix(']')?;
    let open = body.find('[')?;
    let (name, digits) = (&body[..open], &body[open + 1..]);

    if name.is_empty() || name.contains(']') || digits.is_empty() {
        return None;
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    digits.parse().ok().map(|index| (name, index))
}
