use std::path::Path;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochRecord {
    /// One-based epoch number.
    pub epoch: usize,
    pub lr: f64,
    pub train_loss: f64,
    pub train_acc: f64,
    pub test_loss: f64,
    pub test_acc: f64,
}

/// Per-epoch metrics of a training run, in epoch order.
#[derive(Debug, Clone, Default)]
pub struct History {
    records: Vec<EpochRecord>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.records.last()
    }

    pub fn min_train_loss(&self) -> Option<f64> {
        self.records
            .iter()
            .map(|record| record.train_loss)
            .min_by(f64::total_cmp)
    }

    pub fn max_test_acc(&self) -> Option<f64> {
        self.records
            .iter()
            .map(|record| record.test_acc)
            .max_by(f64::total_cmp)
    }

    /// The earliest epoch with the lowest training loss.
    pub fn best_train_epoch(&self) -> Option<&EpochRecord> {
        self.records
            .iter()
            .min_by(|a, b| a.train_loss.total_cmp(&b.train_loss))
    }

    /// The earliest epoch with the highest test accuracy.
    pub fn best_test_epoch(&self) -> Option<&EpochRecord> {
        self.records
            .iter()
            .max_by(|a, b| a.test_acc.total_cmp(&b.test_acc).then(b.epoch.cmp(&a.epoch)))
    }

    pub fn save(&self, path: &Path) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;

        for record in &self.records {
            writer.serialize(record)?;
        }

        Ok(writer.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(epoch: usize, train_loss: f64, test_acc: f64) -> EpochRecord {
        EpochRecord {
            epoch,
            lr: 0.001,
            train_loss,
            train_acc: 0.5,
            test_loss: 1.0,
            test_acc,
        }
    }

    fn history() -> History {
        let mut history = History::new();

        for record in [
            record(1, 3.0, 0.2),
            record(2, 1.0, 0.7),
            record(3, 2.0, 0.7),
            record(4, 1.0, 0.4),
        ] {
            history.push(record);
        }

        history
    }

    #[test]
    fn finds_the_earliest_best_epochs() {
        let history = history();

        assert_eq!(history.len(), 4);
        assert_eq!(history.min_train_loss(), Some(1.0));
        assert_eq!(history.max_test_acc(), Some(0.7));
        assert_eq!(history.best_train_epoch().map(|record| record.epoch), Some(2));
        assert_eq!(history.best_test_epoch().map(|record| record.epoch), Some(2));
    }

    #[test]
    fn empty_history_has_no_best() {
        let history = History::new();

        assert!(history.is_empty());
        assert_eq!(history.min_train_loss(), None);
        assert!(history.best_test_epoch().is_none());
    }

    #[test]
    fn writes_one_row_per_epoch() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("history.csv");

        history().save(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();

        assert_eq!(
            lines.next(),
            Some("epoch,lr,train_loss,train_acc,test_loss,test_acc")
        );
        assert_eq!(lines.next(), Some("1,0.001,3.0,0.5,1.0,0.2"));
        assert_eq!(lines.count(), 3);
    }
}
