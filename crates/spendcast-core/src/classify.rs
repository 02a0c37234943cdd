//! Category classification
//!
//! Multinomial naive Bayes over transaction descriptions. Features are the
//! normalized description words, adjacent word pairs, and a coarse amount
//! bucket (order of magnitude), so "UBER *TRIP 12.40" and "UBER EATS 31.00"
//! can land in different categories.
//!
//! The classifier is trained per user on that user's already-categorized
//! expenses and only ever suggests; records are never modified.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::error::{Error, Result};
use crate::models::{CategorySuggestion, ExpenseRecord};

/// Trained per-user category classifier
#[derive(Debug, Clone)]
pub struct CategoryClassifier {
    /// Categories seen in training, in configuration order
    categories: Vec<String>,
    log_priors: Vec<f64>,
    /// Per category: token -> log likelihood
    log_likelihoods: Vec<HashMap<String, f64>>,
    /// Per category: log likelihood of a known token unseen in that category
    unseen_log_likelihood: Vec<f64>,
    vocabulary: HashSet<String>,
    splitter: Regex,
}

impl CategoryClassifier {
    /// Train on records labelled with a configured category
    ///
    /// Labels are matched case-insensitively. Records with no label, or a label
    /// outside the configured set, are ignored.
    pub fn train(records: &[ExpenseRecord], config: &ClassifierConfig) -> Result<Self> {
        let splitter = Regex::new(r"[^a-z]+")?;

        let labelled: Vec<(usize, &ExpenseRecord)> = records
            .iter()
            .filter_map(|r| {
                let label = r.category.as_deref()?;
                config
                    .categories
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(label))
                    .map(|idx| (idx, r))
            })
            .collect();

        if labelled.len() < config.min_training_examples {
            return Err(Error::InsufficientData {
                required: config.min_training_examples,
                actual: labelled.len(),
            });
        }

        let mut present: Vec<usize> = labelled.iter().map(|(idx, _)| *idx).collect();
        present.sort_unstable();
        present.dedup();
        if present.len() < 2 {
            return Err(Error::InsufficientData {
                required: 2,
                actual: present.len(),
            });
        }

        let slot: HashMap<usize, usize> = present
            .iter()
            .enumerate()
            .map(|(slot, idx)| (*idx, slot))
            .collect();
        let mut doc_counts = vec![0usize; present.len()];
        let mut token_counts: Vec<HashMap<String, f64>> = vec![HashMap::new(); present.len()];
        let mut vocabulary = HashSet::new();

        for (idx, record) in &labelled {
            let s = slot[idx];
            doc_counts[s] += 1;
            for token in tokenize(&splitter, &record.description, record.amount) {
                vocabulary.insert(token.clone());
                *token_counts[s].entry(token).or_insert(0.0) += 1.0;
            }
        }

        let alpha = config.smoothing;
        let vocab_size = vocabulary.len() as f64;
        let total_docs = labelled.len() as f64;

        let mut log_priors = Vec::with_capacity(present.len());
        let mut log_likelihoods = Vec::with_capacity(present.len());
        let mut unseen_log_likelihood = Vec::with_capacity(present.len());
        for (s, counts) in token_counts.into_iter().enumerate() {
            let total_tokens: f64 = counts.values().sum();
            let denominator = total_tokens + alpha * vocab_size;

            log_priors.push((doc_counts[s] as f64 / total_docs).ln());
            unseen_log_likelihood.push((alpha / denominator).ln());
            log_likelihoods.push(
                counts
                    .into_iter()
                    .map(|(token, count)| (token, ((count + alpha) / denominator).ln()))
                    .collect(),
            );
        }

        let categories: Vec<String> = present
            .iter()
            .map(|idx| config.categories[*idx].clone())
            .collect();

        debug!(
            examples = labelled.len(),
            categories = categories.len(),
            vocabulary = vocabulary.len(),
            "Trained category classifier"
        );

        Ok(Self {
            categories,
            log_priors,
            log_likelihoods,
            unseen_log_likelihood,
            vocabulary,
            splitter,
        })
    }

    /// Categories the classifier can predict
    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Most likely category for a record, with its posterior probability
    pub fn suggest(&self, record: &ExpenseRecord) -> CategorySuggestion {
        let tokens: Vec<String> = tokenize(&self.splitter, &record.description, record.amount)
            .into_iter()
            .filter(|t| self.vocabulary.contains(t))
            .collect();

        let scores: Vec<f64> = (0..self.categories.len())
            .map(|s| {
                self.log_priors[s]
                    + tokens
                        .iter()
                        .map(|t| {
                            self.log_likelihoods[s]
                                .get(t)
                                .copied()
                                .unwrap_or(self.unseen_log_likelihood[s])
                        })
                        .sum::<f64>()
            })
            .collect();

        // Softmax; first category wins ties
        let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exp: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = exp.iter().sum();
        let best = scores
            .iter()
            .position(|s| *s == max)
            .unwrap_or(0);

        CategorySuggestion {
            transaction_id: record.id.clone(),
            current_category: record.category.clone(),
            suggested_category: self.categories[best].clone(),
            confidence: exp[best] / total,
        }
    }

    /// Suggestions for records whose predicted category differs from the
    /// current one. Uncategorized records always get a suggestion.
    pub fn suggest_all(&self, records: &[ExpenseRecord]) -> Vec<CategorySuggestion> {
        records
            .iter()
            .map(|r| self.suggest(r))
            .filter(|s| match &s.current_category {
                Some(current) => !current.eq_ignore_ascii_case(&s.suggested_category),
                None => true,
            })
            .collect()
    }
}

/// Normalized description words, bigrams, and an amount magnitude bucket
fn tokenize(splitter: &Regex, description: &str, amount: f64) -> Vec<String> {
    let lowered = description.to_lowercase();
    let words: Vec<&str> = splitter
        .split(&lowered)
        .filter(|w| w.len() >= 2)
        .collect();

    let mut tokens: Vec<String> = words.iter().map(|w| w.to_string()).collect();
    tokens.extend(words.windows(2).map(|pair| format!("{}_{}", pair[0], pair[1])));
    tokens.push(format!("amt:{}", (amount + 1.0).log10().floor() as i64));
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(id: &str, description: &str, amount: f64, category: Option<&str>) -> ExpenseRecord {
        ExpenseRecord::new(
            id,
            "alice",
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            amount,
            category.map(String::from),
            description,
        )
        .unwrap()
    }

    fn training_set() -> Vec<ExpenseRecord> {
        let mut records = Vec::new();
        let samples = [
            ("STARBUCKS COFFEE #1234", 5.5, "Food"),
            ("WHOLE FOODS MARKET", 84.0, "Food"),
            ("CHIPOTLE MEXICAN GRILL", 13.2, "Food"),
            ("UBER TRIP HELP.UBER.COM", 18.0, "Transportation"),
            ("SHELL OIL 5744", 45.0, "Transportation"),
            ("LYFT RIDE SAT", 22.0, "Transportation"),
            ("NETFLIX.COM", 15.49, "Entertainment"),
            ("SPOTIFY USA", 10.99, "Entertainment"),
            ("AMC THEATRES", 24.0, "Entertainment"),
        ];
        for round in 0..3 {
            for (i, (desc, amount, category)) in samples.iter().enumerate() {
                records.push(record(
                    &format!("r{}-{}", round, i),
                    desc,
                    *amount,
                    Some(*category),
                ));
            }
        }
        records
    }

    #[test]
    fn test_tokenize() {
        let splitter = Regex::new(r"[^a-z]+").unwrap();
        let tokens = tokenize(&splitter, "UBER *TRIP 12.40", 12.4);
        assert_eq!(tokens, vec!["uber", "trip", "uber_trip", "amt:1"]);
    }

    #[test]
    fn test_suggests_known_merchant() {
        let classifier =
            CategoryClassifier::train(&training_set(), &ClassifierConfig::default()).unwrap();

        let suggestion = classifier.suggest(&record("x", "STARBUCKS STORE 998", 6.0, None));
        assert_eq!(suggestion.suggested_category, "Food");
        assert!(suggestion.confidence > 0.5 && suggestion.confidence <= 1.0);

        let suggestion = classifier.suggest(&record("y", "UBER TRIP", 21.0, None));
        assert_eq!(suggestion.suggested_category, "Transportation");
    }

    #[test]
    fn test_confidences_are_probabilities() {
        let classifier =
            CategoryClassifier::train(&training_set(), &ClassifierConfig::default()).unwrap();
        let suggestion = classifier.suggest(&record("z", "COMPLETELY UNKNOWN", 1.0, None));
        assert!(suggestion.confidence > 0.0 && suggestion.confidence <= 1.0);
    }

    #[test]
    fn test_insufficient_examples() {
        let records: Vec<ExpenseRecord> = training_set().into_iter().take(5).collect();
        let err = CategoryClassifier::train(&records, &ClassifierConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientData {
                required: 20,
                actual: 5
            }
        ));
    }

    #[test]
    fn test_single_category_rejected() {
        let records: Vec<ExpenseRecord> = (0..25)
            .map(|i| record(&i.to_string(), "GROCERY", 30.0, Some("Food")))
            .collect();
        let err = CategoryClassifier::train(&records, &ClassifierConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientData {
                required: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_unknown_labels_ignored() {
        let mut records = training_set();
        records.push(record("odd", "STARBUCKS", 5.0, Some("Crypto")));
        records.push(record("lower", "STARBUCKS", 5.0, Some("food")));

        let classifier = CategoryClassifier::train(&records, &ClassifierConfig::default()).unwrap();
        assert!(!classifier.categories().iter().any(|c| c == "Crypto"));
        assert_eq!(classifier.categories().len(), 3);
    }

    #[test]
    fn test_suggest_all_skips_agreeing_records() {
        let classifier =
            CategoryClassifier::train(&training_set(), &ClassifierConfig::default()).unwrap();

        let records = vec![
            record("a", "STARBUCKS COFFEE", 5.0, Some("Food")),
            record("b", "STARBUCKS COFFEE", 5.0, Some("Entertainment")),
            record("c", "NETFLIX.COM", 15.49, None),
        ];
        let suggestions = classifier.suggest_all(&records);

        let ids: Vec<&str> = suggestions.iter().map(|s| s.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(suggestions[0].current_category.as_deref(), Some("Entertainment"));
        assert_eq!(suggestions[0].suggested_category, "Food");
        // Records are borrowed immutably; the original label is untouched
        assert_eq!(records[1].category.as_deref(), Some("Entertainment"));
    }
}
