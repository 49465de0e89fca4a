use std::collections::BTreeSet;

/// Per-card gate for a student's study deck. Cards unlock strictly in
/// order: opening card i is what makes card i+1 openable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardGate {
    Opened,
    Openable,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    OutOfRange,
    Locked,
}

pub fn card_gate(opened: &BTreeSet<usize>, index: usize) -> CardGate {
    if opened.contains(&index) {
        return CardGate::Opened;
    }
    if index == 0 || opened.contains(&(index - 1)) {
        return CardGate::Openable;
    }
    CardGate::Locked
}

/// Opening IS completing: a successful open records the card immediately,
/// there is no separate mark-complete step.
pub fn open_card(
    opened: &mut BTreeSet<usize>,
    deck_len: usize,
    index: usize,
) -> Result<(), OpenError> {
    if index >= deck_len {
        return Err(OpenError::OutOfRange);
    }
    match card_gate(opened, index) {
        CardGate::Locked => Err(OpenError::Locked),
        CardGate::Opened | CardGate::Openable => {
            opened.insert(index);
            Ok(())
        }
    }
}

/// Reading material unlocks once every card has been opened. An empty deck
/// means no gate at all.
pub fn material_unlocked(deck_len: usize, opened: &BTreeSet<usize>) -> bool {
    if deck_len == 0 {
        return true;
    }
    (0..deck_len).all(|i| opened.contains(&i))
}

/// The review view has no partial-credit unlocking: submitted or nothing.
pub fn review_unlocked(is_submitted: bool) -> bool {
    is_submitted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_card_is_always_openable() {
        let opened = BTreeSet::new();
        assert_eq!(card_gate(&opened, 0), CardGate::Openable);
        assert_eq!(card_gate(&opened, 1), CardGate::Locked);
        assert_eq!(card_gate(&opened, 2), CardGate::Locked);
    }

    #[test]
    fn opening_unlocks_only_the_next_card() {
        let mut opened = BTreeSet::new();
        open_card(&mut opened, 3, 0).expect("open card 0");
        assert_eq!(card_gate(&opened, 1), CardGate::Openable);
        assert_eq!(card_gate(&opened, 2), CardGate::Locked);

        // Skipping ahead is rejected and records nothing.
        assert_eq!(open_card(&mut opened, 3, 2), Err(OpenError::Locked));
        assert!(!opened.contains(&2));
    }

    #[test]
    fn reopening_an_opened_card_is_a_no_op() {
        let mut opened = BTreeSet::new();
        open_card(&mut opened, 3, 0).expect("open card 0");
        open_card(&mut opened, 3, 0).expect("reopen card 0");
        assert_eq!(opened.len(), 1);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut opened = BTreeSet::new();
        assert_eq!(open_card(&mut opened, 0, 0), Err(OpenError::OutOfRange));
        assert_eq!(open_card(&mut opened, 3, 3), Err(OpenError::OutOfRange));
    }

    #[test]
    fn material_gate_requires_full_deck() {
        let mut opened = BTreeSet::new();
        assert!(!material_unlocked(3, &opened));
        open_card(&mut opened, 3, 0).expect("open 0");
        open_card(&mut opened, 3, 1).expect("open 1");
        assert!(!material_unlocked(3, &opened));
        open_card(&mut opened, 3, 2).expect("open 2");
        assert!(material_unlocked(3, &opened));
    }

    #[test]
    fn empty_deck_has_no_gate() {
        let opened = BTreeSet::new();
        assert!(material_unlocked(0, &opened));
    }

    #[test]
    fn review_gate_is_all_or_nothing() {
        assert!(!review_unlocked(false));
        assert!(review_unlocked(true));
    }
}
