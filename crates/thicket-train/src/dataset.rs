use std::{ffi::OsStr, io, path::Path};

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DatasetError {
    #[error("dataset has no samples")]
    Empty,
    #[error("shape {shape:?} holds {expected} values but {actual} were given")]
    FeatureCount {
        shape: [usize; 4],
        expected: usize,
        actual: usize,
    },
    #[error("{labels} labels were given for {samples} samples")]
    LabelCount { labels: usize, samples: usize },
    #[error("row {row} has a label `{label}` that is not a finite number")]
    InvalidLabel { row: usize, label: String },
    #[error("row {row} has a value `{value}` that is not a number")]
    InvalidValue { row: usize, value: String },
    #[error("rows of {length} values cannot be folded into a height of {height}")]
    IndivisibleRow { length: usize, height: usize },
    #[error("label {0} is not one of the known classes")]
    UnknownLabel(f64),
    #[error("class {found} was listed where class {expected} was expected")]
    NonContiguousClasses { expected: usize, found: usize },
    #[error("failed to read delimited data")]
    Csv(#[from] csv::Error),
}

/// Samples of shape `[channels, height, width]` with class labels in `0..classes`.
#[derive(Debug, Clone)]
pub struct Dataset {
    features: Vec<f32>,
    shape: [usize; 4],
    labels: Vec<usize>,
}

pub struct Batch<B: Backend> {
    pub features: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl Dataset {
    /// Creates a dataset from row-major features of shape `[samples, channels, height, width]`.
    pub fn new(
        features: Vec<f32>,
        shape: [usize; 4],
        labels: Vec<usize>,
    ) -> Result<Self, DatasetError> {
        let expected = shape.iter().product::<usize>();

        if shape[0] == 0 {
            return Err(DatasetError::Empty);
        }

        if features.len() != expected {
            return Err(DatasetError::FeatureCount {
                shape,
                expected,
                actual: features.len(),
            });
        }

        if labels.len() != shape[0] {
            return Err(DatasetError::LabelCount {
                labels: labels.len(),
                samples: shape[0],
            });
        }

        Ok(Self {
            features,
            shape,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample_shape(&self) -> [usize; 3] {
        [self.shape[1], self.shape[2], self.shape[3]]
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    fn sample_len(&self) -> usize {
        self.sample_shape().iter().product()
    }

    /// Gathers the samples at `indices` into tensors on `device`.
    pub fn batch<B: Backend>(&self, indices: &[usize], device: &B::Device) -> Batch<B> {
        let sample_len = self.sample_len();
        let [channels, height, width] = self.sample_shape();

        let features = indices
            .iter()
            .flat_map(|&index| &self.features[index * sample_len..(index + 1) * sample_len])
            .copied()
            .collect::<Vec<_>>();
        let targets = indices
            .iter()
            .map(|&index| self.labels[index] as i64)
            .collect::<Vec<_>>();

        Batch {
            features: Tensor::from_data(
                TensorData::new(features, [indices.len(), channels, height, width])
                    .convert::<B::FloatElem>(),
                device,
            ),
            targets: Tensor::from_data(
                TensorData::new(targets, [indices.len()]).convert::<B::IntElem>(),
                device,
            ),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ClassRow {
    class: usize,
    label: f64,
}

/// Maps raw numeric labels onto contiguous class indices, in ascending label order.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelEncoder {
    classes: Vec<f64>,
}

impl LabelEncoder {
    pub fn fit<'a>(label_sets: impl IntoIterator<Item = &'a [f64]>) -> Self {
        let mut classes = label_sets
            .into_iter()
            .flatten()
            .copied()
            .collect::<Vec<_>>();

        classes.sort_by(f64::total_cmp);
        classes.dedup();

        Self { classes }
    }

    pub fn classes(&self) -> &[f64] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn encode(&self, label: f64) -> Option<usize> {
        self.classes
            .binary_search_by(|class| class.total_cmp(&label))
            .ok()
    }

    pub fn save(&self, path: &Path) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;

        for (class, &label) in self.classes.iter().enumerate() {
            writer.serialize(ClassRow { class, label })?;
        }

        Ok(writer.flush()?)
    }

    /// Loads classes saved by [`LabelEncoder::save`]. The class indices must cover `0..k` exactly
    /// once each.
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let mut rows = csv::Reader::from_path(path)?
            .deserialize::<ClassRow>()
            .collect::<Result<Vec<_>, _>>()?;

        rows.sort_by_key(|row| row.class);

        if let Some((expected, row)) = rows
            .iter()
            .enumerate()
            .find(|(expected, row)| row.class != *expected)
        {
            return Err(DatasetError::NonContiguousClasses {
                expected,
                found: row.class,
            });
        }

        Ok(Self {
            classes: rows.into_iter().map(|row| row.label).collect(),
        })
    }
}

/// Delimited rows of the form `label, value, value, ...` before label encoding.
#[derive(Debug, Clone, Default)]
pub struct LabeledRows {
    labels: Vec<f64>,
    values: Vec<Vec<f32>>,
}

impl LabeledRows {
    /// Reads rows from `path`, tab separated for `.tsv` files and comma separated otherwise.
    pub fn read(path: &Path) -> Result<Self, DatasetError> {
        let delimiter = match path.extension().and_then(OsStr::to_str) {
            Some("tsv") => b'\t',
            _ => b',',
        };

        Self::parse(Self::reader_builder(delimiter).from_path(path)?)
    }

    pub fn parse_from(source: impl io::Read, delimiter: u8) -> Result<Self, DatasetError> {
        Self::parse(Self::reader_builder(delimiter).from_reader(source))
    }

    fn reader_builder(delimiter: u8) -> csv::ReaderBuilder {
        let mut builder = csv::ReaderBuilder::new();
        builder
            .has_headers(false)
            .delimiter(delimiter)
            .trim(csv::Trim::All);

        builder
    }

    fn parse<R: io::Read>(mut reader: csv::Reader<R>) -> Result<Self, DatasetError> {
        let mut rows = Self::default();

        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let mut fields = record.iter();

            let label = fields.next().unwrap_or_default();
            rows.labels.push(
                label
                    .parse::<f64>()
                    .ok()
                    .filter(|label| label.is_finite())
                    .ok_or_else(|| DatasetError::InvalidLabel {
                        row,
                        label: label.to_owned(),
                    })?,
            );

            rows.values.push(
                fields
                    .map(|value| {
                        value.parse::<f32>().map_err(|_| DatasetError::InvalidValue {
                            row,
                            value: value.to_owned(),
                        })
                    })
                    .collect::<Result<_, _>>()?,
            );
        }

        Ok(rows)
    }

    pub fn labels(&self) -> &[f64] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Encodes the labels and folds every row into a single channel `[height, length / height]`
    /// sample.
    pub fn into_dataset(
        self,
        encoder: &LabelEncoder,
        height: usize,
    ) -> Result<Dataset, DatasetError> {
        let length = self.values.first().map_or(0, Vec::len);

        if height == 0 || length == 0 || length % height != 0 {
            return Err(DatasetError::IndivisibleRow { length, height });
        }

        let labels = self
            .labels
            .iter()
            .map(|&label| encoder.encode(label).ok_or(DatasetError::UnknownLabel(label)))
            .collect::<Result<Vec<_>, _>>()?;

        Dataset::new(
            self.values.into_iter().flatten().collect(),
            [labels.len(), 1, height, length / height],
            labels,
        )
    }
}
