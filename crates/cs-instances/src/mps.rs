//! Free-format MPS reader.
//!
//! Only the structure needed for feature extraction is kept: variable types
//! and bounds, objective coefficients, and the sparse constraint rows with
//! their senses and right-hand sides.
//!
//! Sections: NAME, OBJSENSE, ROWS, COLUMNS (with `MARKER INTORG/INTEND`),
//! RHS, RANGES, BOUNDS, ENDATA. Files ending in `.gz` are decompressed on the
//! fly.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use cs_types::ExtractionError;
use flate2::read::GzDecoder;

/// Variable domain after bounds are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Binary,
    Integer,
    Continuous,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub kind: VarKind,
    pub lower: f64,
    pub upper: f64,
    pub objective: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSense {
    Equal,
    LessEqual,
    GreaterEqual,
}

/// One constraint row: `lhs <= a'x <= rhs` depending on the sense.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub name: String,
    pub sense: RowSense,
    pub rhs: f64,
    pub range: Option<f64>,
    /// (variable index, coefficient), in column order.
    pub entries: Vec<(usize, f64)>,
}

/// Parsed MIP in row-wise form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MipModel {
    pub name: String,
    pub maximize: bool,
    pub variables: Vec<Variable>,
    pub constraints: Vec<Constraint>,
}

impl MipModel {
    pub fn num_nonzeros(&self) -> usize {
        self.constraints.iter().map(|c| c.entries.len()).sum()
    }

    pub fn count_kind(&self, kind: VarKind) -> usize {
        self.variables.iter().filter(|v| v.kind == kind).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Name,
    ObjSense,
    Rows,
    Columns,
    Rhs,
    Ranges,
    Bounds,
    End,
}

/// Open an MPS file, decompressing `.gz` transparently, and parse it.
pub fn read_mps_file(
    path: &Path,
    instance: &str,
    max_nonzeros: u64,
) -> Result<MipModel, ExtractionError> {
    let file = File::open(path).map_err(|e| ExtractionError::Unreadable {
        instance: instance.to_string(),
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let is_gz = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);

    let reader: Box<dyn BufRead> = if is_gz {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    parse_mps(reader, instance, max_nonzeros)
}

/// Parse MPS text from any buffered reader.
pub fn parse_mps<R: BufRead>(
    reader: R,
    instance: &str,
    max_nonzeros: u64,
) -> Result<MipModel, ExtractionError> {
    let mut parser = Parser::new(instance, max_nonzeros);
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| ExtractionError::Parse {
            instance: instance.to_string(),
            line: idx + 1,
            message: format!("read failure: {e}"),
        })?;
        parser.line_no = idx + 1;
        parser.feed(&line)?;
        if parser.section == Section::End {
            break;
        }
    }
    parser.finish()
}

struct Parser<'a> {
    instance: &'a str,
    max_nonzeros: u64,
    line_no: usize,
    section: Section,
    model: MipModel,
    objective_row: Option<String>,
    row_index: HashMap<String, usize>,
    col_index: HashMap<String, usize>,
    in_integer_block: bool,
    nonzeros: u64,
}

impl<'a> Parser<'a> {
    fn new(instance: &'a str, max_nonzeros: u64) -> Self {
        Self {
            instance,
            max_nonzeros,
            line_no: 0,
            section: Section::None,
            model: MipModel::default(),
            objective_row: None,
            row_index: HashMap::new(),
            col_index: HashMap::new(),
            in_integer_block: false,
            nonzeros: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ExtractionError {
        ExtractionError::Parse {
            instance: self.instance.to_string(),
            line: self.line_no,
            message: message.into(),
        }
    }

    fn number(&self, token: &str) -> Result<f64, ExtractionError> {
        token
            .parse::<f64>()
            .map_err(|_| self.error(format!("expected a number, found {token:?}")))
    }

    fn feed(&mut self, line: &str) -> Result<(), ExtractionError> {
        if line.trim().is_empty() || line.starts_with('*') {
            return Ok(());
        }

        let is_header = !line.starts_with(' ') && !line.starts_with('\t');
        let tokens: Vec<&str> = line.split_whitespace().collect();

        if is_header {
            return self.header(&tokens);
        }

        match self.section {
            Section::Name => Ok(()),
            Section::ObjSense => {
                self.model.maximize = tokens[0].to_ascii_uppercase().starts_with("MAX");
                Ok(())
            }
            Section::Rows => self.row(&tokens),
            Section::Columns => self.column(&tokens),
            Section::Rhs => self.rhs(&tokens),
            Section::Ranges => self.range(&tokens),
            Section::Bounds => self.bound(&tokens),
            Section::None | Section::End => Err(self.error("data line outside of any section")),
        }
    }

    fn header(&mut self, tokens: &[&str]) -> Result<(), ExtractionError> {
        let keyword = tokens[0].to_ascii_uppercase();
        self.section = match keyword.as_str() {
            "NAME" => {
                self.model.name = tokens.get(1).map(|s| s.to_string()).unwrap_or_default();
                Section::Name
            }
            "OBJSENSE" => {
                if let Some(sense) = tokens.get(1) {
                    self.model.maximize = sense.to_ascii_uppercase().starts_with("MAX");
                }
                Section::ObjSense
            }
            "ROWS" => Section::Rows,
            "COLUMNS" => Section::Columns,
            "RHS" => Section::Rhs,
            "RANGES" => Section::Ranges,
            "BOUNDS" => Section::Bounds,
            "ENDATA" => Section::End,
            other => return Err(self.error(format!("unknown section {other}"))),
        };
        Ok(())
    }

    fn row(&mut self, tokens: &[&str]) -> Result<(), ExtractionError> {
        if tokens.len() < 2 {
            return Err(self.error("row definition needs a type and a name"));
        }
        let name = tokens[1].to_string();
        let sense = match tokens[0].to_ascii_uppercase().as_str() {
            "N" => {
                // Only the first free row is the objective; later ones are ignored.
                if self.objective_row.is_none() {
                    self.objective_row = Some(name);
                }
                return Ok(());
            }
            "E" => RowSense::Equal,
            "L" => RowSense::LessEqual,
            "G" => RowSense::GreaterEqual,
            other => return Err(self.error(format!("unknown row type {other}"))),
        };
        if self.row_index.contains_key(&name) {
            return Err(self.error(format!("duplicate row {name}")));
        }
        self.row_index.insert(name.clone(), self.model.constraints.len());
        self.model.constraints.push(Constraint {
            name,
            sense,
            rhs: 0.0,
            range: None,
            entries: Vec::new(),
        });
        Ok(())
    }

    fn column(&mut self, tokens: &[&str]) -> Result<(), ExtractionError> {
        if tokens.len() >= 3 && tokens[1].trim_matches('\'').eq_ignore_ascii_case("MARKER") {
            match tokens[2].trim_matches('\'').to_ascii_uppercase().as_str() {
                "INTORG" => self.in_integer_block = true,
                "INTEND" => self.in_integer_block = false,
                other => return Err(self.error(format!("unknown marker {other}"))),
            }
            return Ok(());
        }
        if tokens.len() != 3 && tokens.len() != 5 {
            return Err(self.error("column entry needs one or two (row, value) pairs"));
        }

        let col = self.column_index(tokens[0]);
        for pair in tokens[1..].chunks(2) {
            let value = self.number(pair[1])?;
            if self.objective_row.as_deref() == Some(pair[0]) {
                self.model.variables[col].objective = value;
                continue;
            }
            let Some(&row) = self.row_index.get(pair[0]) else {
                // Entries of secondary free rows are skipped.
                continue;
            };
            if value == 0.0 {
                continue;
            }
            self.nonzeros += 1;
            if self.nonzeros > self.max_nonzeros {
                return Err(ExtractionError::TooLarge {
                    instance: self.instance.to_string(),
                    what: "non-zero".to_string(),
                    actual: self.nonzeros,
                    limit: self.max_nonzeros,
                });
            }
            self.model.constraints[row].entries.push((col, value));
        }
        Ok(())
    }

    fn column_index(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.col_index.get(name) {
            return idx;
        }
        let idx = self.model.variables.len();
        let kind = if self.in_integer_block {
            VarKind::Integer
        } else {
            VarKind::Continuous
        };
        self.model.variables.push(Variable {
            name: name.to_string(),
            kind,
            lower: 0.0,
            upper: f64::INFINITY,
            objective: 0.0,
        });
        self.col_index.insert(name.to_string(), idx);
        idx
    }

    /// Split an optional leading set name off `name value [name value]` data.
    fn pairs<'t>(&self, tokens: &'t [&'t str]) -> Result<&'t [&'t str], ExtractionError> {
        let data = if tokens.len() % 2 == 1 { &tokens[1..] } else { tokens };
        if data.is_empty() {
            return Err(self.error("expected (row, value) pairs"));
        }
        Ok(data)
    }

    fn rhs(&mut self, tokens: &[&str]) -> Result<(), ExtractionError> {
        for pair in self.pairs(tokens)?.chunks(2) {
            let value = self.number(pair[1])?;
            if let Some(&row) = self.row_index.get(pair[0]) {
                self.model.constraints[row].rhs = value;
            }
        }
        Ok(())
    }

    fn range(&mut self, tokens: &[&str]) -> Result<(), ExtractionError> {
        for pair in self.pairs(tokens)?.chunks(2) {
            let value = self.number(pair[1])?;
            if let Some(&row) = self.row_index.get(pair[0]) {
                self.model.constraints[row].range = Some(value);
            }
        }
        Ok(())
    }

    fn bound(&mut self, tokens: &[&str]) -> Result<(), ExtractionError> {
        if tokens.len() < 2 {
            return Err(self.error("bound entry needs a type and a column"));
        }
        let kind = tokens[0].to_ascii_uppercase();
        let valueless = matches!(kind.as_str(), "FR" | "MI" | "PL");

        let (col_name, value) = if valueless {
            (tokens[tokens.len().min(3) - 1], None)
        } else if kind == "BV" {
            // `BV col`, `BV set col`, `BV col 1` and `BV set col 1` all occur.
            match tokens.len() {
                2 => (tokens[1], None),
                3 if self.col_index.contains_key(tokens[1]) => (tokens[1], None),
                _ => (tokens[2], None),
            }
        } else {
            match tokens.len() {
                3 => (tokens[1], Some(self.number(tokens[2])?)),
                4 => (tokens[2], Some(self.number(tokens[3])?)),
                _ => return Err(self.error(format!("malformed {kind} bound"))),
            }
        };

        let Some(&col) = self.col_index.get(col_name) else {
            return Err(self.error(format!("bound on unknown column {col_name}")));
        };
        let value = value.unwrap_or(0.0);
        let var = &mut self.model.variables[col];

        match kind.as_str() {
            "LO" => var.lower = value,
            "UP" => {
                var.upper = value;
                if value < 0.0 && var.lower == 0.0 {
                    var.lower = f64::NEG_INFINITY;
                }
            }
            "FX" => {
                var.lower = value;
                var.upper = value;
            }
            "FR" => {
                var.lower = f64::NEG_INFINITY;
                var.upper = f64::INFINITY;
            }
            "MI" => var.lower = f64::NEG_INFINITY,
            "PL" => var.upper = f64::INFINITY,
            "BV" => {
                var.kind = VarKind::Binary;
                var.lower = 0.0;
                var.upper = 1.0;
            }
            "LI" => {
                var.kind = VarKind::Integer;
                var.lower = value;
            }
            "UI" => {
                var.kind = VarKind::Integer;
                var.upper = value;
            }
            "SC" => var.upper = value,
            other => return Err(self.error(format!("unknown bound type {other}"))),
        }
        Ok(())
    }

    fn finish(mut self) -> Result<MipModel, ExtractionError> {
        if self.section != Section::End {
            return Err(self.error("missing ENDATA"));
        }
        for var in &mut self.model.variables {
            if var.kind == VarKind::Integer && var.lower == 0.0 && var.upper == 1.0 {
                var.kind = VarKind::Binary;
            }
        }
        Ok(self.model)
    }
}
