//! PlantUML diagram generation

use std::collections::HashSet;

use crate::StateKey;

/// Render registered states, guarded pairs and observed transitions.
///
/// Observed transitions are solid arrows, guarded pairs that were never taken
/// are dotted. States with no edge are listed on their own.
pub(crate) fn generate_plantuml<K: StateKey>(
    states: &[K],
    guarded: &[(K, K)],
    transitions: &HashSet<(K, K)>,
    current: Option<&K>,
) -> String {
    let mut plantuml = String::new();
    plantuml.push_str("@startuml\n");
    plantuml.push_str("skinparam state {\n");
    plantuml.push_str("  BackgroundColor<<Current>> YellowGreen\n");
    plantuml.push_str("}\n\n");

    let mut seen: HashSet<&K> = HashSet::new();

    for pair in transitions {
        let (from, to) = pair;
        if guarded.contains(pair) {
            plantuml.push_str(&format!("{:?} --> {:?} : [guard]\n", from, to));
        } else {
            plantuml.push_str(&format!("{:?} --> {:?}\n", from, to));
        }
        seen.insert(from);
        seen.insert(to);
    }

    for pair in guarded {
        let (from, to) = pair;
        if !transitions.contains(pair) {
            plantuml.push_str(&format!("{:?} ..> {:?} : [guard]\n", from, to));
            seen.insert(from);
            seen.insert(to);
        }
    }

    for state in states {
        if !seen.contains(state) {
            plantuml.push_str(&format!("state {:?}\n", state));
        }
    }

    if let Some(current) = current {
        plantuml.push_str(&format!("state {:?} <<Current>>\n", current));
    }

    plantuml.push_str("@enduml\n");
    plantuml
}
