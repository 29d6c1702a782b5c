use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LetterBand {
    pub letter: String,
    pub min: f64,
}

/// Bands ordered by descending `min`; the first band whose `min` the score
/// reaches wins.
#[derive(Debug, Clone, PartialEq)]
pub struct LetterScale {
    bands: Vec<LetterBand>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LetterGrade {
    pub letter: Option<String>,
    /// Set for scores outside [0, 100]: accepted by the rollup, flagged here.
    pub suspect: bool,
}

impl Default for LetterScale {
    fn default() -> Self {
        let bands = [
            ("A", 85.0),
            ("AB", 80.0),
            ("B", 75.0),
            ("BC", 70.0),
            ("C", 60.0),
            ("D", 50.0),
            ("E", 0.0),
        ]
        .iter()
        .map(|(letter, min)| LetterBand {
            letter: letter.to_string(),
            min: *min,
        })
        .collect();
        LetterScale { bands }
    }
}

impl LetterScale {
    pub fn new(mut bands: Vec<LetterBand>) -> Result<Self, String> {
        if bands.is_empty() {
            return Err("letter scale must contain at least one band".into());
        }
        for b in &bands {
            if b.letter.trim().is_empty() {
                return Err("letter must not be empty".into());
            }
            if !b.min.is_finite() {
                return Err(format!("band {} has a non-finite min", b.letter));
            }
        }
        bands.sort_by(|a, b| b.min.partial_cmp(&a.min).unwrap_or(std::cmp::Ordering::Equal));
        if bands.windows(2).any(|w| w[0].min == w[1].min) {
            return Err("letter scale mins must be distinct".into());
        }
        Ok(LetterScale { bands })
    }

    pub fn from_json(raw: &Value) -> Result<Self, String> {
        let Some(arr) = raw.as_array() else {
            return Err("scale must be an array of {letter, min}".into());
        };
        let mut bands = Vec::with_capacity(arr.len());
        for (i, v) in arr.iter().enumerate() {
            let letter = v.get("letter").and_then(|x| x.as_str()).map(|s| s.trim());
            let min = v.get("min").and_then(|x| x.as_f64());
            let (Some(letter), Some(min)) = (letter, min) else {
                return Err(format!("scale[{}] must have string letter and numeric min", i));
            };
            if letter.len() > 4 {
                return Err(format!("scale[{}].letter is too long", i));
            }
            bands.push(LetterBand {
                letter: letter.to_string(),
                min,
            });
        }
        LetterScale::new(bands)
    }

    pub fn to_json(&self) -> Value {
        json!(self.bands)
    }

    pub fn grade(&self, score: f64) -> LetterGrade {
        let suspect = !(0.0..=100.0).contains(&score);
        let letter = if score.is_finite() {
            self.bands
                .iter()
                .find(|b| score >= b.min)
                .map(|b| b.letter.clone())
        } else {
            None
        };
        LetterGrade { letter, suspect }
    }
}
