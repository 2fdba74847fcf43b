use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufRead},
    path::Path,
};

const DEFAULT_COLOR: (u32, u32, u32) = (0, 255, 0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorLabel {
    pub label: String,
    pub red: u32,
    pub green: u32,
    pub blue: u32,
}

impl ColorLabel {
    pub fn new(label: impl Into<String>) -> Self {
        let (red, green, blue) = DEFAULT_COLOR;
        Self {
            label: label.into(),
            red,
            green,
            blue,
        }
    }
}

/// Class id to label mapping of a loaded model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassLabels {
    labels: BTreeMap<usize, ColorLabel>,
}

impl ClassLabels {
    /// Builds a mapping with contiguous ids and the default color.
    pub fn from_names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        names
            .into_iter()
            .enumerate()
            .map(|(id, name)| (id, ColorLabel::new(name)))
            .collect()
    }

    pub fn get(&self, class_id: usize) -> Option<&ColorLabel> {
        self.labels.get(&class_id)
    }

    pub fn contains(&self, class_id: usize) -> bool {
        self.labels.contains_key(&class_id)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl FromIterator<(usize, ColorLabel)> for ClassLabels {
    fn from_iter<T: IntoIterator<Item = (usize, ColorLabel)>>(iter: T) -> Self {
        Self {
            labels: iter.into_iter().collect(),
        }
    }
}


/// Reads a labels file with one `label,red,green,blue` entry per line.
/// The line number is the class id.
pub fn load_labels_file(filepath: &Path) -> io::Result<ClassLabels> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut color_labels = BTreeMap::new();

    for (class_id, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let parts: Vec<&str> = line.split(',').collect();

        if parts.len() == 4 {
            let label = parts[0].trim().to_string();
            let red: u32 = parts[1]
                .trim()
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Invalid red value"))?;
            let green: u32 = parts[2]
                .trim()
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Invalid green value"))?;
            let blue: u32 = parts[3]
                .trim()
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Invalid blue value"))?;

            color_labels.insert(
                class_id,
                ColorLabel {
                    label,
                    red,
                    green,
                    blue,
                },
            );
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid line format: {}", line),
            ));
        }
    }

    Ok(ClassLabels {
        labels: color_labels,
    })
}

/// Parses the `names` metadata entry of an exported YOLO model,
/// e.g. `{0: 'person', 1: 'bicycle', 2: "driver's seat"}`.
pub fn parse_names_metadata(raw: &str) -> Result<ClassLabels, String> {
    let body = raw
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| format!("names metadata is not a mapping: {}", raw))?;

    let mut labels = BTreeMap::new();
    let mut rest = body.trim_start();

    while !rest.is_empty() {
        let (key, after_key) = rest
            .split_once(':')
            .ok_or_else(|| format!("missing `:` in names metadata near `{}`", rest))?;
        let class_id: usize = key
            .trim()
            .parse()
            .map_err(|_| format!("invalid class id `{}`", key.trim()))?;

        let after_key = after_key.trim_start();
        let quote = after_key
            .chars()
            .next()
            .filter(|c| *c == '\'' || *c == '"')
            .ok_or_else(|| format!("label for class {} is not quoted", class_id))?;
        let value = &after_key[1..];
        let end = value
            .find(quote)
            .ok_or_else(|| format!("unterminated label for class {}", class_id))?;

        labels.insert(class_id, ColorLabel::new(&value[..end]));

        rest = value[end + 1..].trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    }

    if labels.is_empty() {
        return Err("names metadata is empty".to_string());
    }

    Ok(ClassLabels { labels })
}
