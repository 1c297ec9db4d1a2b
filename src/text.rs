//! Plain-text matrices and vectors: one row per line, values separated by
//! whitespace or commas, `#` starting a comment.

use core::fmt;
use std::fs;
use std::io;
use std::path::Path;

use faer_core::{Mat, MatRef};

#[derive(Debug)]
pub enum TextError {
    Io(io::Error),
    /// A token is not a number.
    Parse { line: usize, token: String },
    /// A row has a different number of values than the first row.
    Ragged {
        line: usize,
        expected: usize,
        found: usize,
    },
    /// No values at all.
    Empty,
    /// A vector was expected but the data has several rows and columns.
    NotAVector { nrows: usize, ncols: usize },
}

impl fmt::Display for TextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "i/o error: {err}"),
            Self::Parse { line, token } => {
                write!(f, "line {line}: cannot parse \"{token}\" as a number")
            }
            Self::Ragged {
                line,
                expected,
                found,
            } => write!(f, "line {line}: expected {expected} values, found {found}"),
            Self::Empty => write!(f, "no numeric data found"),
            Self::NotAVector { nrows, ncols } => {
                write!(f, "expected a vector, found a {nrows}x{ncols} matrix")
            }
        }
    }
}

impl std::error::Error for TextError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TextError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

pub fn parse_matrix(text: &str) -> Result<Mat<f64>, TextError> {
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let content = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        let mut row = Vec::new();
        for token in content
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
        {
            let value = token.parse::<f64>().map_err(|_| TextError::Parse {
                line: line_no,
                token: token.to_string(),
            })?;
            row.push(value);
        }
        if row.is_empty() {
            continue;
        }
        if let Some(first) = rows.first() {
            if first.len() != row.len() {
                return Err(TextError::Ragged {
                    line: line_no,
                    expected: first.len(),
                    found: row.len(),
                });
            }
        }
        rows.push(row);
    }

    let ncols = match rows.first() {
        Some(first) => first.len(),
        None => return Err(TextError::Empty),
    };
    Ok(Mat::from_fn(rows.len(), ncols, |i, j| rows[i][j]))
}

/// A single row or a single column, flattened.
pub fn parse_vector(text: &str) -> Result<Vec<f64>, TextError> {
    let matrix = parse_matrix(text)?;
    let (nrows, ncols) = (matrix.nrows(), matrix.ncols());
    if nrows == 1 {
        Ok((0..ncols).map(|j| matrix.read(0, j)).collect())
    } else if ncols == 1 {
        Ok((0..nrows).map(|i| matrix.read(i, 0)).collect())
    } else {
        Err(TextError::NotAVector { nrows, ncols })
    }
}

pub fn load_matrix(path: impl AsRef<Path>) -> Result<Mat<f64>, TextError> {
    parse_matrix(&fs::read_to_string(path)?)
}

pub fn load_vector(path: impl AsRef<Path>) -> Result<Vec<f64>, TextError> {
    parse_vector(&fs::read_to_string(path)?)
}

pub fn format_matrix(matrix: MatRef<'_, f64>) -> String {
    let mut out = String::new();
    for i in 0..matrix.nrows() {
        let row: Vec<String> = (0..matrix.ncols())
            .map(|j| matrix.read(i, j).to_string())
            .collect();
        out.push_str(&row.join(" "));
        out.push('\n');
    }
    out
}

pub fn save_matrix(path: impl AsRef<Path>, matrix: MatRef<'_, f64>) -> Result<(), TextError> {
    fs::write(path, format_matrix(matrix))?;
    Ok(())
}

/// Writes the vector as a single line.
pub fn save_vector(path: impl AsRef<Path>, values: &[f64]) -> Result<(), TextError> {
    let line: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    fs::write(path, line.join(" ") + "\n")?;
    Ok(())
}
