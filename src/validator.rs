//! Malha Fina: cross-record screening for missing identifiers, conflicting
//! identities, shared cards and duplicate payments.
//!
//! Detection is a pure function over a slice of records. `apply` writes the
//! resulting flags back and emits an audit entry for each record whose flag
//! set changed. Nothing is ever deleted here.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::audit::{AuditAction, AuditLogEntry, AuditSink};
use crate::models::{AnomalyFlag, Competence, FlagSet, PaymentRecord};
use crate::settings::DuplicatePolicy;
use crate::text::normalize_name;

/// Flags that can be decided from a single record.
pub fn missing_flags(record: &PaymentRecord) -> FlagSet {
    let mut flags = FlagSet::default();
    if record.cpf.len() != 11 || !record.cpf.bytes().all(|b| b.is_ascii_digit()) {
        flags.insert(AnomalyFlag::MissingCpf);
    }
    if record.card_number.is_empty() {
        flags.insert(AnomalyFlag::MissingCard);
    }
    flags
}

/// Most frequent value wins; ties go to the most recent competence, then to
/// the value seen first.
fn pick_canonical<'a, I>(values: I) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, Competence)>,
{
    // value -> (count, latest competence, first position)
    let mut stats: HashMap<&str, (usize, Competence, usize)> = HashMap::new();
    for (pos, (value, competence)) in values.into_iter().enumerate() {
        let entry = stats.entry(value).or_insert((0, competence, pos));
        entry.0 += 1;
        if competence > entry.1 {
            entry.1 = competence;
        }
    }
    stats
        .into_iter()
        .max_by(|(_, a), (_, b)| {
            a.0.cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(b.2.cmp(&a.2))
        })
        .map(|(value, _)| value)
}

fn group_by<'a, F>(records: &'a [PaymentRecord], skip: AnomalyFlag, key: F) -> HashMap<&'a str, Vec<usize>>
where
    F: Fn(&'a PaymentRecord) -> &'a str,
{
    let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, r) in records.iter().enumerate() {
        if missing_flags(r).contains(skip) {
            continue;
        }
        groups.entry(key(r)).or_default().push(i);
    }
    groups
}

/// Display name to report for each cpf: the most frequent spelling.
pub fn canonical_names(records: &[PaymentRecord]) -> HashMap<String, String> {
    let by_cpf = group_by(records, AnomalyFlag::MissingCpf, |r| r.cpf.as_str());
    let mut names = HashMap::with_capacity(by_cpf.len());
    for (cpf, idxs) in by_cpf {
        let normalized: Vec<(String, usize)> = idxs
            .iter()
            .map(|&i| (normalize_name(&records[i].name), i))
            .collect();
        let chosen = pick_canonical(
            normalized
                .iter()
                .map(|(n, i)| (n.as_str(), records[*i].competence)),
        );
        if let Some(chosen) = chosen {
            // keep the original spelling of the first record carrying it
            if let Some((_, i)) = normalized.iter().find(|(n, _)| n == chosen) {
                names.insert(cpf.to_string(), records[*i].name.clone());
            }
        }
    }
    names
}

fn duplicate_key(record: &PaymentRecord, policy: DuplicatePolicy) -> String {
    match policy {
        DuplicatePolicy::CpfAmount => format!("{}|{}", record.cpf, record.amount.normalize()),
        DuplicatePolicy::Cpf => record.cpf.clone(),
    }
}

/// Compute the full flag set of every record.
pub fn detect(records: &[PaymentRecord], policy: DuplicatePolicy) -> Vec<FlagSet> {
    let mut flags: Vec<FlagSet> = records.iter().map(missing_flags).collect();

    let by_cpf = group_by(records, AnomalyFlag::MissingCpf, |r| r.cpf.as_str());
    for idxs in by_cpf.values() {
        if idxs.len() < 2 {
            continue;
        }

        let names: HashSet<String> = idxs.iter().map(|&i| normalize_name(&records[i].name)).collect();
        if names.len() > 1 {
            for &i in idxs {
                flags[i].insert(AnomalyFlag::CpfNameConflict);
            }
        }

        // card changes between periods are reissues; inside one period they are not
        let mut by_period: BTreeMap<Competence, Vec<usize>> = BTreeMap::new();
        for &i in idxs {
            if !records[i].card_number.is_empty() {
                by_period.entry(records[i].competence).or_default().push(i);
            }
        }
        for period in by_period.values() {
            let cards: HashSet<&str> = period.iter().map(|&i| records[i].card_number.as_str()).collect();
            if cards.len() < 2 {
                continue;
            }
            let canonical = pick_canonical(
                period
                    .iter()
                    .map(|&i| (records[i].card_number.as_str(), records[i].competence)),
            );
            for &i in period {
                if Some(records[i].card_number.as_str()) != canonical {
                    flags[i].insert(AnomalyFlag::CpfCardConflict);
                }
            }
        }

        let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
        for &i in idxs {
            by_key.entry(duplicate_key(&records[i], policy)).or_default().push(i);
        }
        for group in by_key.values() {
            if group.len() < 2 {
                continue;
            }
            let mut per_period: BTreeMap<Competence, Vec<usize>> = BTreeMap::new();
            for &i in group {
                per_period.entry(records[i].competence).or_default().push(i);
            }
            for same_period in per_period.values().filter(|v| v.len() > 1) {
                for &i in same_period {
                    flags[i].insert(AnomalyFlag::DuplicateInvalid);
                }
            }
            if per_period.len() > 1 {
                for &i in group {
                    flags[i].insert(AnomalyFlag::DuplicateRecurring);
                }
            }
        }
    }

    let by_card = group_by(records, AnomalyFlag::MissingCard, |r| r.card_number.as_str());
    for idxs in by_card.values() {
        let cpfs: HashSet<&str> = idxs
            .iter()
            .map(|&i| records[i].cpf.as_str())
            .filter(|c| !c.is_empty())
            .collect();
        if cpfs.len() > 1 {
            for &i in idxs {
                flags[i].insert(AnomalyFlag::CardMultiCpf);
            }
        }
    }

    flags
}

#[derive(Debug, Default)]
pub struct ValidationOutcome {
    /// Indexes of records whose flag set changed.
    pub changed: Vec<usize>,
    pub counts: BTreeMap<AnomalyFlag, usize>,
    pub clean: usize,
    pub flagged: usize,
}

fn entity(record: &PaymentRecord) -> String {
    match record.id {
        Some(id) => format!("payment:{id}"),
        None => format!("{}#{}", record.source_file, record.row_index),
    }
}

/// Run detection and store the result on each record.
pub fn apply(
    records: &mut [PaymentRecord],
    policy: DuplicatePolicy,
    actor: &str,
    sink: &mut dyn AuditSink,
) -> ValidationOutcome {
    let detected = detect(records, policy);
    let mut outcome = ValidationOutcome::default();
    for (i, (record, flags)) in records.iter_mut().zip(detected).enumerate() {
        for flag in flags.iter() {
            *outcome.counts.entry(*flag).or_default() += 1;
        }
        if flags.is_empty() {
            outcome.clean += 1;
        } else {
            outcome.flagged += 1;
        }
        if record.flags != flags || (record.id.is_none() && !flags.is_empty()) {
            let before = record.flags.to_codes();
            let after = flags.to_codes();
            if flags.contains(AnomalyFlag::CardMultiCpf) && !record.flags.contains(AnomalyFlag::CardMultiCpf) {
                tracing::warn!(cpf = %record.cpf, card = %record.card_number, "card shared by several cpfs");
            }
            sink.emit(AuditLogEntry::now(
                actor,
                AuditAction::FlagsChanged,
                entity(record),
                format!("[{before}] -> [{after}]"),
            ));
            record.flags = flags;
            outcome.changed.push(i);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn comp(month: u32) -> Competence {
        Competence::new(month, 2025).unwrap()
    }

    fn rec(cpf: &str, card: &str, name: &str, cents: i64, month: u32) -> PaymentRecord {
        PaymentRecord {
            id: None,
            cpf: crate::text::normalize_cpf(cpf),
            cpf_original: cpf.to_string(),
            card_number: card.to_string(),
            name: name.to_string(),
            amount: Decimal::new(cents, 2),
            competence: comp(month),
            project: None,
            source_file: "f.csv".to_string(),
            row_index: 0,
            flags: FlagSet::default(),
        }
    }

    fn has(flags: &FlagSet, flag: AnomalyFlag) -> bool {
        flags.contains(flag)
    }

    #[test]
    fn test_missing_identifiers() {
        let records = vec![
            rec("", "100", "Ana", 1000, 1),
            rec("123456789012", "101", "Bia", 1000, 1),
            rec("11122233344", "", "Caio", 1000, 1),
            rec("11122233355", "102", "Davi", 1000, 1),
        ];
        let flags = detect(&records, DuplicatePolicy::CpfAmount);
        assert!(has(&flags[0], AnomalyFlag::MissingCpf));
        assert!(has(&flags[1], AnomalyFlag::MissingCpf));
        assert!(has(&flags[2], AnomalyFlag::MissingCard));
        assert!(flags[3].is_empty());
    }

    #[test]
    fn test_name_conflict_is_accent_insensitive() {
        let records = vec![
            rec("11122233344", "100", "João da Silva", 1000, 1),
            rec("11122233344", "100", "JOAO DA  SILVA", 1000, 2),
            rec("22233344455", "200", "Maria", 1000, 1),
            rec("22233344455", "200", "Mariana", 1000, 2),
        ];
        let flags = detect(&records, DuplicatePolicy::CpfAmount);
        assert!(!has(&flags[0], AnomalyFlag::CpfNameConflict));
        assert!(!has(&flags[1], AnomalyFlag::CpfNameConflict));
        assert!(has(&flags[2], AnomalyFlag::CpfNameConflict));
        assert!(has(&flags[3], AnomalyFlag::CpfNameConflict));
    }

    #[test]
    fn test_canonical_name_most_frequent_then_most_recent() {
        let records = vec![
            rec("22233344455", "200", "Maria", 1000, 1),
            rec("22233344455", "200", "Mariana", 1000, 2),
            rec("22233344455", "200", "Maria", 1000, 3),
            rec("33344455566", "300", "Pedro", 1000, 1),
            rec("33344455566", "300", "Pedro Henrique", 1000, 4),
        ];
        let names = canonical_names(&records);
        assert_eq!(names["22233344455"], "Maria");
        assert_eq!(names["33344455566"], "Pedro Henrique");
    }

    #[test]
    fn test_same_period_card_conflict_flags_deviating_record() {
        // two rows, same cpf, same period, different cards
        let records = vec![
            rec("123.456.789-00", "5001", "Ana", 1000, 3),
            rec("123.456.789-00", "5002", "Ana", 2000, 3),
        ];
        let flags = detect(&records, DuplicatePolicy::CpfAmount);
        let conflicted = flags.iter().filter(|f| has(f, AnomalyFlag::CpfCardConflict)).count();
        assert_eq!(conflicted, 1);
        assert!(has(&flags[1], AnomalyFlag::CpfCardConflict));
        assert_eq!(records[0].cpf, "12345678900");
        assert_eq!(records[1].cpf, "12345678900");
    }

    #[test]
    fn test_card_change_across_periods_is_not_conflict() {
        let records = vec![
            rec("11122233344", "5001", "Ana", 1000, 1),
            rec("11122233344", "5009", "Ana", 1500, 2),
        ];
        let flags = detect(&records, DuplicatePolicy::CpfAmount);
        assert!(flags.iter().all(|f| !has(f, AnomalyFlag::CpfCardConflict)));
    }

    #[test]
    fn test_card_multi_cpf_is_symmetric() {
        let records = vec![
            rec("11122233344", "7777", "Ana", 1000, 1),
            rec("22233344455", "7777", "Bia", 1100, 1),
            rec("33344455566", "7777", "Caio", 1200, 2),
            rec("44455566677", "8888", "Davi", 1200, 2),
        ];
        let flags = detect(&records, DuplicatePolicy::CpfAmount);
        for f in &flags[..3] {
            assert!(has(f, AnomalyFlag::CardMultiCpf));
        }
        assert!(!has(&flags[3], AnomalyFlag::CardMultiCpf));
    }

    #[test]
    fn test_card_multi_cpf_fires_alone() {
        let records = vec![
            rec("11122233344", "7777", "Ana", 1000, 1),
            rec("22233344455", "7777", "Bia", 1100, 1),
        ];
        let flags = detect(&records, DuplicatePolicy::CpfAmount);
        for f in &flags {
            assert_eq!(f.to_codes(), "CARD_MULTI_CPF");
        }
    }

    #[test]
    fn test_duplicate_within_period_is_invalid() {
        let records = vec![
            rec("11122233344", "5001", "Ana", 120000, 3),
            rec("11122233344", "5001", "Ana", 120000, 3),
        ];
        let flags = detect(&records, DuplicatePolicy::CpfAmount);
        for f in &flags {
            assert!(has(f, AnomalyFlag::DuplicateInvalid));
            assert!(!has(f, AnomalyFlag::DuplicateRecurring));
        }
    }

    #[test]
    fn test_duplicate_across_periods_is_recurring_only() {
        let records = vec![
            rec("11122233344", "5001", "Ana", 120000, 3),
            rec("11122233344", "5001", "Ana", 120000, 4),
        ];
        let flags = detect(&records, DuplicatePolicy::CpfAmount);
        for f in &flags {
            assert!(has(f, AnomalyFlag::DuplicateRecurring));
            assert!(!has(f, AnomalyFlag::DuplicateInvalid));
            assert!(!f.is_blocking());
        }
    }

    #[test]
    fn test_amount_scale_does_not_hide_duplicates() {
        let mut a = rec("11122233344", "5001", "Ana", 0, 3);
        a.amount = Decimal::new(1200, 0);
        let mut b = rec("11122233344", "5001", "Ana", 0, 3);
        b.amount = Decimal::new(120000, 2);
        let flags = detect(&[a, b], DuplicatePolicy::CpfAmount);
        assert!(has(&flags[0], AnomalyFlag::DuplicateInvalid));
    }

    #[test]
    fn test_cpf_policy_ignores_amount() {
        let records = vec![
            rec("11122233344", "5001", "Ana", 100000, 3),
            rec("11122233344", "5001", "Ana", 120000, 3),
        ];
        let strict = detect(&records, DuplicatePolicy::CpfAmount);
        assert!(!has(&strict[0], AnomalyFlag::DuplicateInvalid));
        let loose = detect(&records, DuplicatePolicy::Cpf);
        assert!(has(&loose[0], AnomalyFlag::DuplicateInvalid));
    }

    #[test]
    fn test_apply_audits_only_changes() {
        let mut records = vec![
            rec("11122233344", "7777", "Ana", 1000, 1),
            rec("22233344455", "7777", "Bia", 1100, 1),
            rec("33344455566", "8888", "Caio", 1200, 1),
        ];
        for (i, r) in records.iter_mut().enumerate() {
            r.id = Some(i as i64 + 1);
        }
        let mut audit: Vec<AuditLogEntry> = Vec::new();
        let outcome = apply(&mut records, DuplicatePolicy::CpfAmount, "ana", &mut audit);
        assert_eq!(outcome.changed, vec![0, 1]);
        assert_eq!(outcome.flagged, 2);
        assert_eq!(outcome.clean, 1);
        assert_eq!(outcome.counts[&AnomalyFlag::CardMultiCpf], 2);
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[0].affected_entity, "payment:1");

        let mut again: Vec<AuditLogEntry> = Vec::new();
        let second = apply(&mut records, DuplicatePolicy::CpfAmount, "ana", &mut again);
        assert!(second.changed.is_empty());
        assert!(again.is_empty());
    }
}
