use crate::query::QueryIntent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sections of the assembled context, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetCategory {
    CurrentFile,
    LspDefinitions,
    Bm25Results,
    CallGraph,
    TypeDefinitions,
}

impl BudgetCategory {
    pub const ALL: [BudgetCategory; 5] = [
        BudgetCategory::CurrentFile,
        BudgetCategory::LspDefinitions,
        BudgetCategory::Bm25Results,
        BudgetCategory::CallGraph,
        BudgetCategory::TypeDefinitions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetCategory::CurrentFile => "current_file",
            BudgetCategory::LspDefinitions => "lsp_definitions",
            BudgetCategory::Bm25Results => "bm25_results",
            BudgetCategory::CallGraph => "call_graph",
            BudgetCategory::TypeDefinitions => "type_definitions",
        }
    }

    pub fn heading(&self) -> &'static str {
        match self {
            BudgetCategory::CurrentFile => "Current file",
            BudgetCategory::LspDefinitions => "Definitions",
            BudgetCategory::Bm25Results => "Relevant code",
            BudgetCategory::CallGraph => "Call graph",
            BudgetCategory::TypeDefinitions => "Type definitions",
        }
    }
}

impl fmt::Display for BudgetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Share of the token budget per category. Fractions are non-negative and
/// sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BudgetAllocation {
    fractions: BTreeMap<BudgetCategory, f64>,
}

/// Base fractions in [`BudgetCategory::ALL`] order.
fn base_table(intent: QueryIntent) -> [f64; 5] {
    match intent {
        QueryIntent::General => [0.30, 0.20, 0.30, 0.10, 0.10],
        QueryIntent::SpecificFunction => [0.20, 0.35, 0.20, 0.15, 0.10],
        QueryIntent::Debugging => [0.35, 0.20, 0.20, 0.15, 0.10],
        QueryIntent::Architecture => [0.15, 0.15, 0.35, 0.25, 0.10],
        QueryIntent::TypeRelated => [0.20, 0.25, 0.20, 0.05, 0.30],
    }
}

const DEBUGGING_CURRENT_FILE_BOOST: f64 = 1.5;
const TYPE_DEFINITIONS_BOOST: f64 = 1.5;

impl BudgetAllocation {
    pub fn for_intent(intent: QueryIntent) -> Self {
        let mut fractions: BTreeMap<BudgetCategory, f64> = BudgetCategory::ALL
            .into_iter()
            .zip(base_table(intent))
            .collect();

        let boost = match intent {
            QueryIntent::Debugging => {
                Some((BudgetCategory::CurrentFile, DEBUGGING_CURRENT_FILE_BOOST))
            }
            QueryIntent::TypeRelated => {
                Some((BudgetCategory::TypeDefinitions, TYPE_DEFINITIONS_BOOST))
            }
            _ => None,
        };
        if let Some((category, factor)) = boost {
            if let Some(f) = fractions.get_mut(&category) {
                *f *= factor;
            }
        }

        let mut allocation = Self { fractions };
        allocation.normalize();
        allocation
    }

    fn normalize(&mut self) {
        let total: f64 = self.fractions.values().sum();
        if total <= 0.0 {
            let even = 1.0 / self.fractions.len() as f64;
            self.fractions.values_mut().for_each(|f| *f = even);
            return;
        }
        self.fractions.values_mut().for_each(|f| *f /= total);
    }

    pub fn fraction(&self, category: BudgetCategory) -> f64 {
        self.fractions.get(&category).copied().unwrap_or(0.0)
    }

    /// Whole tokens available to `category` out of `budget`. Rounds down so
    /// the categories never add up to more than `budget`.
    pub fn tokens_for(&self, category: BudgetCategory, budget: usize) -> usize {
        (budget as f64 * self.fraction(category)).floor() as usize
    }

    pub fn total(&self) -> f64 {
        self.fractions.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BudgetCategory, f64)> + '_ {
        self.fractions.iter().map(|(c, f)| (*c, *f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_intent_sums_to_one() {
        for intent in QueryIntent::ALL {
            let allocation = BudgetAllocation::for_intent(intent);
            assert!((allocation.total() - 1.0).abs() < 0.01, "{intent}");
            assert!(allocation.iter().all(|(_, f)| f >= 0.0));
            assert_eq!(allocation.iter().count(), 5);
        }
    }

    #[test]
    fn test_debugging_boosts_current_file() {
        let general = BudgetAllocation::for_intent(QueryIntent::General);
        let debugging = BudgetAllocation::for_intent(QueryIntent::Debugging);
        assert!(
            debugging.fraction(BudgetCategory::CurrentFile)
                > general.fraction(BudgetCategory::CurrentFile)
        );
    }

    #[test]
    fn test_type_related_boosts_type_definitions() {
        let general = BudgetAllocation::for_intent(QueryIntent::General);
        let types = BudgetAllocation::for_intent(QueryIntent::TypeRelated);
        let share = types.fraction(BudgetCategory::TypeDefinitions);
        assert!(share > general.fraction(BudgetCategory::TypeDefinitions));
        assert!(BudgetCategory::ALL.iter().all(|c| types.fraction(*c) <= share));
    }

    #[test]
    fn test_tokens_never_exceed_budget() {
        for intent in QueryIntent::ALL {
            let allocation = BudgetAllocation::for_intent(intent);
            for budget in [0, 1, 7, 999, 20_000] {
                let sum: usize = BudgetCategory::ALL
                    .iter()
                    .map(|c| allocation.tokens_for(*c, budget))
                    .sum();
                assert!(sum <= budget);
            }
        }
    }

    #[test]
    fn test_serializes_as_map() {
        let allocation = BudgetAllocation::for_intent(QueryIntent::General);
        let json = serde_json::to_value(&allocation).unwrap();
        let share = |key: &str| json[key].as_f64().unwrap();
        assert!((share("current_file") - 0.3).abs() < 1e-9);
        assert!((share("type_definitions") - 0.1).abs() < 1e-9);
    }
}
