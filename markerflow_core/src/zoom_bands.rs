//! Zoom-interval classifier - discretizes continuous zoom into bands.
//!
//! A band table is a packed token sequence: boundaries joined by comparison
//! operators.
//!
//! ```text
//! boundary := number            point band, representative = number
//!           | number x number   closed range, representative = raw zoom
//!           | inf               unbounded end (first or last only)
//! table    := boundary ( ("<" | "<=") boundary )*
//! ```
//!
//! The zoom values strictly between two boundaries belong to the boundary on
//! the closed side of the operator: `a < b` hands them to `a`, `a <= b` to
//! `b`. Unbounded ends behave like wildcard boundaries.
//!
//! Example: `[0, "<", 10, "x", 10, "<=", 15, "x", 15]`
//!
//! ```text
//! zoom:   0 ────────── 10 ───────── 15 ────
//! value:  0  (0 < z<10) raw (10<z<=15) raw   None above 15
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operator and wildcard tokens of a band table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandSymbol {
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessEq,
    #[serde(rename = "x")]
    Wildcard,
    #[serde(rename = "inf")]
    Unbounded,
}

/// One token of a packed band table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BandToken {
    Value(f64),
    Symbol(BandSymbol),
}

impl From<f64> for BandToken {
    fn from(v: f64) -> Self {
        Self::Value(v)
    }
}

impl From<BandSymbol> for BandToken {
    fn from(s: BandSymbol) -> Self {
        Self::Symbol(s)
    }
}

/// Errors building a band table.
#[derive(Debug, Error, PartialEq)]
pub enum BandError {
    #[error("band table is empty")]
    Empty,

    #[error("unexpected token {token:?} at position {position}")]
    UnexpectedToken { position: usize, token: BandToken },

    #[error("band table ends after an operator")]
    DanglingOperator,

    #[error("boundaries must be strictly increasing (at position {0})")]
    NotAscending(usize),

    #[error("unbounded token allowed only at either end (at position {0})")]
    MisplacedUnbounded(usize),

    #[error("zoom value at position {0} is not finite")]
    NotFinite(usize),

    #[error("invalid band table JSON: {0}")]
    Json(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Representative {
    Fixed(f64),
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Boundary {
    Point(f64),
    Range(f64, f64),
    Unbounded,
}

impl Boundary {
    fn representative(&self) -> Representative {
        match self {
            Boundary::Point(v) => Representative::Fixed(*v),
            Boundary::Range(..) | Boundary::Unbounded => Representative::Raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    lo: f64,
    lo_closed: bool,
    hi: f64,
    hi_closed: bool,
    rep: Representative,
}

impl Segment {
    fn admits_upper(&self, zoom: f64) -> bool {
        zoom < self.hi || (self.hi_closed && zoom == self.hi)
    }

    fn admits_lower(&self, zoom: f64) -> bool {
        zoom > self.lo || (self.lo_closed && zoom == self.lo)
    }
}

/// Result of classifying one zoom value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandHit {
    /// Index of the band in ascending order
    pub index: usize,
    /// Representative zoom (raw zoom for wildcard bands)
    pub value: f64,
}

/// Compiled, binary-searchable band table.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoomBands {
    segments: Vec<Segment>,
}

impl ZoomBands {
    /// Compiles a packed token sequence.
    pub fn parse(tokens: &[BandToken]) -> Result<Self, BandError> {
        if tokens.is_empty() {
            return Err(BandError::Empty);
        }

        let mut boundaries: Vec<(usize, Boundary)> = Vec::new();
        let mut ops: Vec<BandSymbol> = Vec::new();
        let mut i = 0;
        loop {
            let start = i;
            let boundary = match tokens.get(i) {
                Some(BandToken::Value(v)) => {
                    if !v.is_finite() {
                        return Err(BandError::NotFinite(i));
                    }
                    if let Some(BandToken::Symbol(BandSymbol::Wildcard)) = tokens.get(i + 1) {
                        match tokens.get(i + 2) {
                            Some(BandToken::Value(hi)) if hi.is_finite() => {
                                if hi < v {
                                    return Err(BandError::NotAscending(i + 2));
                                }
                                i += 3;
                                Boundary::Range(*v, *hi)
                            }
                            Some(BandToken::Value(_)) => return Err(BandError::NotFinite(i + 2)),
                            Some(token) => {
                                return Err(BandError::UnexpectedToken {
                                    position: i + 2,
                                    token: *token,
                                })
                            }
                            None => return Err(BandError::DanglingOperator),
                        }
                    } else {
                        i += 1;
                        Boundary::Point(*v)
                    }
                }
                Some(BandToken::Symbol(BandSymbol::Unbounded)) => {
                    i += 1;
                    Boundary::Unbounded
                }
                Some(token) => {
                    return Err(BandError::UnexpectedToken {
                        position: i,
                        token: *token,
                    })
                }
                None => return Err(BandError::DanglingOperator),
            };
            boundaries.push((start, boundary));

            match tokens.get(i) {
                None => break,
                Some(BandToken::Symbol(op @ (BandSymbol::Less | BandSymbol::LessEq))) => {
                    ops.push(*op);
                    i += 1;
                }
                Some(token) => {
                    return Err(BandError::UnexpectedToken {
                        position: i,
                        token: *token,
                    })
                }
            }
        }

        let last = boundaries.len() - 1;
        for (n, (position, boundary)) in boundaries.iter().enumerate() {
            if *boundary == Boundary::Unbounded && n != 0 && n != last {
                return Err(BandError::MisplacedUnbounded(*position));
            }
        }
        if boundaries.len() == 1 && boundaries[0].1 == Boundary::Unbounded {
            return Err(BandError::Empty);
        }

        let mut segments = Vec::new();
        for (n, (_, boundary)) in boundaries.iter().enumerate() {
            match boundary {
                Boundary::Point(v) => segments.push(Segment {
                    lo: *v,
                    lo_closed: true,
                    hi: *v,
                    hi_closed: true,
                    rep: boundary.representative(),
                }),
                Boundary::Range(lo, hi) => segments.push(Segment {
                    lo: *lo,
                    lo_closed: true,
                    hi: *hi,
                    hi_closed: true,
                    rep: boundary.representative(),
                }),
                Boundary::Unbounded => {}
            }

            if n == last {
                break;
            }
            let (next_position, next) = &boundaries[n + 1];
            let lo = match boundary {
                Boundary::Point(v) | Boundary::Range(_, v) => *v,
                Boundary::Unbounded => f64::NEG_INFINITY,
            };
            let hi = match next {
                Boundary::Point(v) | Boundary::Range(v, _) => *v,
                Boundary::Unbounded => f64::INFINITY,
            };
            if lo >= hi {
                return Err(BandError::NotAscending(*next_position));
            }
            let rep = match ops[n] {
                BandSymbol::Less => boundary.representative(),
                _ => next.representative(),
            };
            segments.push(Segment {
                lo,
                lo_closed: false,
                hi,
                hi_closed: false,
                rep,
            });
        }

        Ok(Self { segments })
    }

    /// Parses a JSON table such as `[0, "<", 10, "x", 10]`.
    pub fn from_json(json: &str) -> Result<Self, BandError> {
        let tokens: Vec<BandToken> =
            serde_json::from_str(json).map_err(|e| BandError::Json(e.to_string()))?;
        Self::parse(&tokens)
    }

    /// A single wildcard band `[min, max]`: raw zoom inside, `None` outside.
    pub fn passthrough(min: f64, max: f64) -> Self {
        Self {
            segments: vec![Segment {
                lo: min,
                lo_closed: true,
                hi: max.max(min),
                hi_closed: true,
                rep: Representative::Raw,
            }],
        }
    }

    /// Finds the band containing `zoom`.
    pub fn locate(&self, zoom: f64) -> Option<BandHit> {
        if zoom.is_nan() {
            return None;
        }
        let index = self.segments.partition_point(|s| !s.admits_upper(zoom));
        let segment = self.segments.get(index)?;
        if !segment.admits_lower(zoom) {
            return None;
        }
        let value = match segment.rep {
            Representative::Fixed(v) => v,
            Representative::Raw => zoom,
        };
        Some(BandHit { index, value })
    }

    /// Representative zoom of the band containing `zoom`, if any.
    pub fn classify(&self, zoom: f64) -> Option<f64> {
        self.locate(zoom).map(|hit| hit.value)
    }

    /// Highest finite boundary, or `None` if the table is unbounded above.
    pub fn top(&self) -> Option<f64> {
        let last = self.segments.last()?;
        last.hi.is_finite().then_some(last.hi)
    }

    /// Whether `zoom` lies above the last band.
    pub fn is_above(&self, zoom: f64) -> bool {
        self.top().is_some_and(|top| zoom > top)
    }
}

/// Free-function form of [`ZoomBands::classify`].
pub fn classify(zoom: f64, bands: &ZoomBands) -> Option<f64> {
    bands.classify(zoom)
}
