//! Species and reaction-rule registry: resolved, immutable model data shared
//! by reference (id) across every molecule instance.

use serde::{Deserialize, Serialize};

use crate::base::{HashMapType, Rate, RuleId, SpeciesId, Time};
use crate::model::ModelError;

/// Reserved wildcard species, pre-registered at fixed ids during model
/// resolution.  They match every molecule, every volume molecule, and every
/// surface molecule respectively, and can appear in count specifications and
/// as generic reactants.
pub const ALL_MOLECULES: SpeciesId = 0;
pub const ALL_VOLUME_MOLECULES: SpeciesId = 1;
pub const ALL_SURFACE_MOLECULES: SpeciesId = 2;

pub const RESERVED_SPECIES_NAMES: [&str; 3] =
    ["ALL_MOLECULES", "ALL_VOLUME_MOLECULES", "ALL_SURFACE_MOLECULES"];

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeciesKind {
    #[serde(alias = "volume")]
    Volume,
    #[serde(alias = "surface")]
    Surface,
}

/// Surface molecule orientation relative to its wall's normal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Orient {
    #[serde(alias = "up")]
    Up,
    #[serde(alias = "down")]
    Down,
    #[serde(alias = "none")]
    #[default]
    None,
}

impl Orient {
    /// Does a molecule's orientation satisfy a pattern's constraint?
    /// `None` in the pattern matches anything.
    pub fn accepts(self, actual: Orient) -> bool {
        self == Orient::None || self == actual
    }

    pub fn normal_sign(self) -> f64 {
        match self {
            Orient::Up => 1.0,
            Orient::Down => -1.0,
            Orient::None => 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Species {
    pub name: String,
    pub kind: SpeciesKind,
    /// 3D diffusion constant (volume molecules).
    pub diff_3d: f64,
    /// In-plane diffusion constant (surface molecules).
    pub diff_2d: f64,
    pub count_enclosed: bool,
    pub custom_time_step: Option<Time>,
    pub custom_space_step: Option<f64>,
}

impl Species {
    pub fn is_wildcard(id: SpeciesId) -> bool {
        id <= ALL_SURFACE_MOLECULES
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Reactant {
    pub species: SpeciesId,
    pub orient: Orient,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Product {
    pub species: SpeciesId,
    pub orient: Orient,
}

/// A resolved reaction rule.  Exactly one of `fwd_rate` and `rate_table` is
/// set; a reverse declaration in the model description expands into a
/// separate rule before resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionRule {
    pub name: String,
    pub reactants: Vec<Reactant>,
    pub products: Vec<Product>,
    pub fwd_rate: Option<Rate>,
    /// Piecewise-constant (time, rate) table, sorted ascending by time.
    pub rate_table: Option<Vec<(Time, Rate)>>,
    /// Interaction radius for bimolecular encounters.
    pub radius: f64,
    /// Permits surface reactants on different geometry objects within the
    /// interaction radius, instead of requiring the same wall.
    pub intermembrane: bool,
}

impl ReactionRule {
    pub fn order(&self) -> usize {
        self.reactants.len()
    }

    /// Rate in effect at simulated time `t`: the last table entry at or
    /// before `t`, zero before the first entry.
    pub fn rate_at(&self, t: Time) -> Rate {
        match (&self.rate_table, self.fwd_rate) {
            (Some(table), _) => {
                let mut rate = 0.0;
                for &(entry_t, entry_rate) in table {
                    if entry_t > t {
                        break;
                    }
                    rate = entry_rate;
                }
                rate
            }
            (None, Some(rate)) => rate,
            (None, None) => 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.reactants.is_empty() || self.reactants.len() > 2 {
            return Err(ModelError::WrongReactantCount {
                rule: self.name.clone(),
                n: self.reactants.len(),
            });
        }
        match (&self.rate_table, self.fwd_rate) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(ModelError::AmbiguousRate {
                    rule: self.name.clone(),
                })
            }
            (Some(table), None) => {
                if !table.windows(2).all(|w| w[0].0 <= w[1].0) {
                    return Err(ModelError::UnsortedRateTable {
                        rule: self.name.clone(),
                    });
                }
                if let Some(&(_, r)) = table.iter().find(|&&(_, r)| r < 0.0) {
                    return Err(ModelError::NegativeRate {
                        rule: self.name.clone(),
                        rate: r,
                    });
                }
            }
            (None, Some(rate)) => {
                if rate < 0.0 {
                    return Err(ModelError::NegativeRate {
                        rule: self.name.clone(),
                        rate,
                    });
                }
            }
        }
        if self.order() == 2 && self.radius <= 0.0 {
            return Err(ModelError::BadRadius {
                rule: self.name.clone(),
                radius: self.radius,
            });
        }
        Ok(())
    }
}

/// Immutable registry of species and reaction rules, with the lookup tables
/// the engine consults per event: per-species unimolecular rule lists and
/// per-ordered-pair bimolecular rule lists, wildcards expanded at build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub species: Vec<Species>,
    pub rules: Vec<ReactionRule>,
    unimol: Vec<Vec<RuleId>>,
    bimol: HashMapType<(SpeciesId, SpeciesId), Vec<RuleId>>,
    max_radius: f64,
}

impl Registry {
    /// `species` must already contain the three reserved wildcards at ids
    /// 0..3 (the model builder guarantees this).
    pub fn new(species: Vec<Species>, rules: Vec<ReactionRule>) -> Result<Self, ModelError> {
        for rule in &rules {
            rule.validate()?;
        }
        let mut reg = Registry {
            unimol: vec![Vec::new(); species.len()],
            bimol: HashMapType::default(),
            max_radius: 0.0,
            species,
            rules,
        };
        for (id, rule) in reg.rules.iter().enumerate() {
            match rule.reactants.as_slice() {
                [r] => {
                    for sp in reg.expand_pattern(r.species) {
                        reg.unimol[sp].push(id);
                    }
                }
                [a, b] => {
                    for sa in reg.expand_pattern(a.species) {
                        for sb in reg.expand_pattern(b.species) {
                            reg.bimol.entry((sa, sb)).or_default().push(id);
                            if sa != sb {
                                reg.bimol.entry((sb, sa)).or_default().push(id);
                            }
                        }
                    }
                    reg.max_radius = reg.max_radius.max(rule.radius);
                }
                _ => unreachable!("validated above"),
            }
        }
        for list in reg.bimol.values_mut() {
            list.sort_unstable();
            list.dedup();
        }
        Ok(reg)
    }

    fn expand_pattern(&self, pattern: SpeciesId) -> Vec<SpeciesId> {
        if !Species::is_wildcard(pattern) {
            return vec![pattern];
        }
        (ALL_SURFACE_MOLECULES + 1..self.species.len())
            .filter(|&sp| self.species_matches(pattern, sp))
            .collect()
    }

    /// Wildcard-aware species match: does concrete species `sp` match the
    /// pattern species `pattern`?
    pub fn species_matches(&self, pattern: SpeciesId, sp: SpeciesId) -> bool {
        match pattern {
            ALL_MOLECULES => true,
            ALL_VOLUME_MOLECULES => self.species[sp].kind == SpeciesKind::Volume,
            ALL_SURFACE_MOLECULES => self.species[sp].kind == SpeciesKind::Surface,
            _ => pattern == sp,
        }
    }

    pub fn unimol_rules(&self, sp: SpeciesId) -> &[RuleId] {
        &self.unimol[sp]
    }

    /// Aggregate unimolecular rate for a species at time `t`.
    pub fn unimol_total_rate(&self, sp: SpeciesId, t: Time) -> Rate {
        self.unimol[sp].iter().map(|&r| self.rules[r].rate_at(t)).sum()
    }

    pub fn bimol_rules(&self, a: SpeciesId, b: SpeciesId) -> &[RuleId] {
        self.bimol.get(&(a, b)).map_or(&[], |v| v.as_slice())
    }

    /// Largest bimolecular interaction radius in the model; the collision
    /// engine pads its neighborhood searches by this.
    pub fn max_radius(&self) -> f64 {
        self.max_radius
    }

    /// Converts a bimolecular rule's rate into a per-encounter reaction
    /// probability for a step of length `dt`, using the step-size-dependent
    /// encounter-volume conversion: encounters involving a volume molecule
    /// normalize by the interaction sphere volume, surface-surface
    /// encounters by the interaction disk area.  Returns the raw
    /// (unclamped) probability; callers clamp to 1 and warn once per rule.
    pub fn bimol_raw_probability(&self, rule: RuleId, dt: Time, now: Time) -> f64 {
        let rule = &self.rules[rule];
        let rate = rule.rate_at(now);
        let r = rule.radius;
        let any_volume = rule
            .reactants
            .iter()
            .any(|re| self.pattern_kind(re.species) != Some(SpeciesKind::Surface));
        let norm = if any_volume {
            4.0 / 3.0 * std::f64::consts::PI * r * r * r
        } else {
            std::f64::consts::PI * r * r
        };
        rate * dt / norm
    }

    fn pattern_kind(&self, pattern: SpeciesId) -> Option<SpeciesKind> {
        match pattern {
            ALL_MOLECULES => None,
            ALL_VOLUME_MOLECULES => Some(SpeciesKind::Volume),
            ALL_SURFACE_MOLECULES => Some(SpeciesKind::Surface),
            _ => Some(self.species[pattern].kind),
        }
    }

    /// Mean displacement scale for one diffusion step: `sqrt(2 D dt)` per
    /// axis, unless the species pins an explicit space step.  Used both for
    /// proposing displacements and for sizing the collision neighborhood.
    pub fn step_scale(&self, sp: SpeciesId, dt: Time) -> f64 {
        let species = &self.species[sp];
        if let Some(s) = species.custom_space_step {
            return s;
        }
        let d = match species.kind {
            SpeciesKind::Volume => species.diff_3d,
            SpeciesKind::Surface => species.diff_2d,
        };
        (2.0 * d * dt).sqrt()
    }

    pub fn time_step_for(&self, sp: SpeciesId, global_dt: Time) -> Time {
        self.species[sp].custom_time_step.unwrap_or(global_dt)
    }

    pub fn species_id(&self, name: &str) -> Option<SpeciesId> {
        self.species.iter().position(|s| s.name == name)
    }
}

/// The three reserved wildcard entries, in reserved-id order.
pub fn wildcard_species() -> Vec<Species> {
    let mk = |name: &str, kind| Species {
        name: name.to_string(),
        kind,
        diff_3d: 0.0,
        diff_2d: 0.0,
        count_enclosed: false,
        custom_time_step: None,
        custom_space_step: None,
    };
    vec![
        mk("ALL_MOLECULES", SpeciesKind::Volume),
        mk("ALL_VOLUME_MOLECULES", SpeciesKind::Volume),
        mk("ALL_SURFACE_MOLECULES", SpeciesKind::Surface),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn species(name: &str, kind: SpeciesKind) -> Species {
        Species {
            name: name.to_string(),
            kind,
            diff_3d: 1e-6,
            diff_2d: 1e-7,
            count_enclosed: false,
            custom_time_step: None,
            custom_space_step: None,
        }
    }

    fn test_registry(rules: Vec<ReactionRule>) -> Registry {
        let mut sp = wildcard_species();
        sp.push(species("A", SpeciesKind::Volume));
        sp.push(species("B", SpeciesKind::Volume));
        sp.push(species("S", SpeciesKind::Surface));
        Registry::new(sp, rules).unwrap()
    }

    fn bimol(name: &str, a: SpeciesId, b: SpeciesId, rate: f64) -> ReactionRule {
        ReactionRule {
            name: name.to_string(),
            reactants: vec![
                Reactant { species: a, orient: Orient::None },
                Reactant { species: b, orient: Orient::None },
            ],
            products: vec![],
            fwd_rate: Some(rate),
            rate_table: None,
            radius: 1e-3,
            intermembrane: false,
        }
    }

    #[test]
    fn pair_lookup_is_symmetric_and_wildcards_expand() {
        let reg = test_registry(vec![bimol("a_b", 3, 4, 1.0), bimol("any_s", ALL_MOLECULES, 5, 2.0)]);
        assert_eq!(reg.bimol_rules(3, 4), &[0]);
        assert_eq!(reg.bimol_rules(4, 3), &[0]);
        // ALL_MOLECULES expands over concrete species only.
        assert_eq!(reg.bimol_rules(3, 5), &[1]);
        assert_eq!(reg.bimol_rules(5, 5), &[1]);
        assert!(reg.bimol_rules(3, 3).is_empty());
    }

    #[test]
    fn rate_table_is_piecewise_constant() {
        let rule = ReactionRule {
            name: "vary".to_string(),
            reactants: vec![Reactant { species: 3, orient: Orient::None }],
            products: vec![],
            fwd_rate: None,
            rate_table: Some(vec![(1.0, 10.0), (2.0, 5.0)]),
            radius: 0.0,
            intermembrane: false,
        };
        rule.validate().unwrap();
        assert_eq!(rule.rate_at(0.5), 0.0);
        assert_eq!(rule.rate_at(1.0), 10.0);
        assert_eq!(rule.rate_at(1.5), 10.0);
        assert_eq!(rule.rate_at(7.0), 5.0);
    }

    #[test]
    fn unsorted_rate_table_is_rejected() {
        let rule = ReactionRule {
            name: "bad".to_string(),
            reactants: vec![Reactant { species: 3, orient: Orient::None }],
            products: vec![],
            fwd_rate: None,
            rate_table: Some(vec![(2.0, 5.0), (1.0, 10.0)]),
            radius: 0.0,
            intermembrane: false,
        };
        assert!(matches!(
            rule.validate(),
            Err(ModelError::UnsortedRateTable { .. })
        ));
    }

    #[test]
    fn probability_grows_with_rate_and_needs_clamping_eventually() {
        let reg = test_registry(vec![bimol("slow", 3, 4, 1e-12), bimol("fast", 3, 4, 1e3)]);
        let dt = 1e-6;
        let p_slow = reg.bimol_raw_probability(0, dt, 0.0);
        let p_fast = reg.bimol_raw_probability(1, dt, 0.0);
        assert!(p_slow < p_fast);
        assert!(p_slow < 1.0);
        assert!(p_fast > 1.0, "huge rate should overflow the raw probability");
    }

    #[test]
    fn custom_space_step_overrides_the_derived_scale() {
        let mut sp = wildcard_species();
        let mut a = species("A", SpeciesKind::Volume);
        a.custom_space_step = Some(0.25);
        sp.push(a);
        sp.push(species("B", SpeciesKind::Volume));
        let reg = Registry::new(sp, vec![]).unwrap();
        assert_eq!(reg.step_scale(3, 1e-6), 0.25);
        assert_eq!(reg.step_scale(4, 1e-6), (2.0 * 1e-6 * 1e-6_f64).sqrt());
    }

    #[test]
    fn unimolecular_rates_aggregate() {
        let unimol = |name: &str, sp, rate| ReactionRule {
            name: name.to_string(),
            reactants: vec![Reactant { species: sp, orient: Orient::None }],
            products: vec![],
            fwd_rate: Some(rate),
            rate_table: None,
            radius: 0.0,
            intermembrane: false,
        };
        let reg = test_registry(vec![unimol("decay1", 3, 2.0), unimol("decay2", 3, 3.0)]);
        assert_eq!(reg.unimol_total_rate(3, 0.0), 5.0);
        assert_eq!(reg.unimol_rules(3), &[0, 1]);
        assert!(reg.unimol_rules(4).is_empty());
    }
}
