//! Model descriptions: the serde-facing declaration of a simulation (species,
//! geometry, reactions, releases, counts), resolved into an [`RdSystem`]
//! before any simulation runs.  Names live here; the resolved system speaks
//! only in ids.

use std::io::Read;
use std::path::Path;

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::base::{ObjectId, SpeciesId, Time, WallId};
use crate::counts::{CountRegion, CountSpec};
use crate::geometry::{GeometryModel, SurfaceClass};
use crate::partition::Partition;
use crate::species::{
    wildcard_species, Orient, Product, Reactant, ReactionRule, Registry, Species, SpeciesKind,
    RESERVED_SPECIES_NAMES,
};
use crate::system::{
    CheckpointPolicy, CountConfig, RdSystem, ReleaseShape, ReleaseSite,
};

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown species name {name:?}")]
    UnknownSpecies { name: String },
    #[error("unknown object name {name:?}")]
    UnknownObject { name: String },
    #[error("species name {name:?} is reserved")]
    ReservedName { name: String },
    #[error("species {name:?} declared twice")]
    DuplicateSpecies { name: String },
    #[error("object {object:?} references vertex {index} out of range")]
    BadVertexIndex { object: String, index: usize },
    #[error("object {object:?} wall {wall} is degenerate (zero area)")]
    DegenerateWall { object: String, wall: WallId },
    #[error("object {object:?} wall {wall} is not movable")]
    ImmovableWall { object: String, wall: WallId },
    #[error("reaction {rule:?} has {n} reactants; 1 or 2 are supported")]
    WrongReactantCount { rule: String, n: usize },
    #[error("reaction {rule:?} must set exactly one of rate and rate_table")]
    AmbiguousRate { rule: String },
    #[error("reaction {rule:?} has a rate table not sorted by time")]
    UnsortedRateTable { rule: String },
    #[error("reaction {rule:?} has negative rate {rate}")]
    NegativeRate { rule: String, rate: f64 },
    #[error("bimolecular reaction {rule:?} needs a positive radius, got {radius}")]
    BadRadius { rule: String, radius: f64 },
    #[error("reaction {rule:?} makes a surface product from volume reactants only")]
    SurfaceProductFromVolume { rule: String },
    #[error("invalid partition: min {min:?}, max {max:?}, cell size {cell}")]
    BadPartition {
        min: [f64; 3],
        max: [f64; 3],
        cell: f64,
    },
    #[error("release site {site:?}: {reason}")]
    BadRelease { site: String, reason: String },
}

fn default_class() -> SurfaceClass {
    SurfaceClass::Reflective
}

fn default_count() -> u32 {
    1
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SpeciesDesc {
    pub name: String,
    #[serde(default = "SpeciesDesc::default_kind")]
    pub kind: SpeciesKind,
    #[serde(default, alias = "diffusion")]
    pub diffusion_3d: f64,
    #[serde(default)]
    pub diffusion_2d: f64,
    #[serde(default)]
    pub count_enclosed: bool,
    #[serde(default)]
    pub custom_time_step: Option<Time>,
    #[serde(default)]
    pub custom_space_step: Option<f64>,
}

impl SpeciesDesc {
    fn default_kind() -> SpeciesKind {
        SpeciesKind::Volume
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ObjectDesc {
    pub name: String,
    pub vertices: Vec<[f64; 3]>,
    /// Triangles as local vertex index triples, counter-clockwise seen from
    /// outside.
    pub walls: Vec<[usize; 3]>,
    #[serde(default = "default_class")]
    pub class: SurfaceClass,
    #[serde(default)]
    pub movable: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReactionDesc {
    #[serde(default)]
    pub name: Option<String>,
    /// Species names, with optional orientation marks: a trailing `'` means
    /// up, a trailing `,` means down.
    pub reactants: Vec<String>,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub rate: Option<f64>,
    #[serde(default)]
    pub rate_table: Option<Vec<(Time, f64)>>,
    /// Expands into a second rule with reactants and products swapped.
    #[serde(default)]
    pub reverse_rate: Option<f64>,
    #[serde(default)]
    pub radius: f64,
    #[serde(default)]
    pub intermembrane: bool,
}

/// Untagged: the variant is picked from the fields present, so a release
/// writes `position:`, `min:`/`max:`, or `object:` directly under `shape:`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum ReleaseShapeDesc {
    Point { position: [f64; 3] },
    Box { min: [f64; 3], max: [f64; 3] },
    Surface { object: String },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReleaseDesc {
    #[serde(default)]
    pub name: Option<String>,
    pub species: String,
    #[serde(default = "default_count")]
    pub count: u32,
    pub shape: ReleaseShapeDesc,
    #[serde(default)]
    pub orient: Orient,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CountDesc {
    pub name: String,
    pub species: String,
    /// Object name, or absent for the whole world.
    #[serde(default)]
    pub region: Option<String>,
    pub period: Time,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CheckpointDesc {
    pub period: Time,
    pub path: std::path::PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PartitionDesc {
    pub min: [f64; 3],
    pub max: [f64; 3],
    pub cell: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModelDesc {
    #[serde(default)]
    pub name: Option<String>,
    pub time_step: Time,
    #[serde(default)]
    pub seed: u64,
    pub partition: PartitionDesc,
    #[serde(default)]
    pub species: Vec<SpeciesDesc>,
    #[serde(default)]
    pub objects: Vec<ObjectDesc>,
    #[serde(default)]
    pub reactions: Vec<ReactionDesc>,
    #[serde(default)]
    pub releases: Vec<ReleaseDesc>,
    #[serde(default)]
    pub counts: Vec<CountDesc>,
    #[serde(default)]
    pub checkpoint: Option<CheckpointDesc>,
}

/// Splits a trailing orientation mark off a species reference.
fn parse_oriented(name: &str) -> (&str, Orient) {
    if let Some(base) = name.strip_suffix('\'') {
        (base, Orient::Up)
    } else if let Some(base) = name.strip_suffix(',') {
        (base, Orient::Down)
    } else {
        (name, Orient::None)
    }
}

impl ModelDesc {
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    pub fn from_yaml(data: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(data)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModelError> {
        let mut file = std::fs::File::open(path.as_ref())?;
        let mut s = String::new();
        file.read_to_string(&mut s)?;
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(Self::from_json(&s)?),
            _ => Ok(Self::from_yaml(&s)?),
        }
    }

    /// Resolves names into ids and builds the immutable system.
    pub fn to_system(&self) -> Result<RdSystem, ModelError> {
        let mut species = wildcard_species();
        for sd in &self.species {
            if RESERVED_SPECIES_NAMES.contains(&sd.name.as_str()) {
                return Err(ModelError::ReservedName {
                    name: sd.name.clone(),
                });
            }
            if species.iter().any(|s| s.name == sd.name) {
                return Err(ModelError::DuplicateSpecies {
                    name: sd.name.clone(),
                });
            }
            species.push(Species {
                name: sd.name.clone(),
                kind: sd.kind,
                diff_3d: sd.diffusion_3d,
                diff_2d: sd.diffusion_2d,
                count_enclosed: sd.count_enclosed,
                custom_time_step: sd.custom_time_step,
                custom_space_step: sd.custom_space_step,
            });
        }
        let species_id = |name: &str| -> Result<SpeciesId, ModelError> {
            species
                .iter()
                .position(|s| s.name == name)
                .ok_or_else(|| ModelError::UnknownSpecies {
                    name: name.to_string(),
                })
        };

        let geometry = self.build_geometry()?;
        let object_id = |name: &str| -> Result<ObjectId, ModelError> {
            geometry
                .objects
                .iter()
                .position(|o| o.name == name)
                .ok_or_else(|| ModelError::UnknownObject {
                    name: name.to_string(),
                })
        };

        let mut rules = Vec::new();
        for rd in &self.reactions {
            let mut reactants = Vec::with_capacity(rd.reactants.len());
            for r in &rd.reactants {
                let (base, orient) = parse_oriented(r);
                reactants.push(Reactant {
                    species: species_id(base)?,
                    orient,
                });
            }
            let mut products = Vec::with_capacity(rd.products.len());
            for p in &rd.products {
                let (base, orient) = parse_oriented(p);
                products.push(Product {
                    species: species_id(base)?,
                    orient,
                });
            }
            let name = rd.name.clone().unwrap_or_else(|| {
                format!("{} -> {}", rd.reactants.join(" + "), rd.products.join(" + "))
            });
            let rule = ReactionRule {
                name: name.clone(),
                reactants: reactants.clone(),
                products: products.clone(),
                fwd_rate: rd.rate,
                rate_table: rd.rate_table.clone(),
                radius: rd.radius,
                intermembrane: rd.intermembrane,
            };
            check_surface_products(&rule, &species)?;
            rules.push(rule);
            if let Some(rev) = rd.reverse_rate {
                let rev_reactants: Vec<Reactant> = products
                    .iter()
                    .map(|p| Reactant {
                        species: p.species,
                        orient: p.orient,
                    })
                    .collect();
                let rev_products: Vec<Product> = reactants
                    .iter()
                    .map(|r| Product {
                        species: r.species,
                        orient: r.orient,
                    })
                    .collect();
                let rev_rule = ReactionRule {
                    name: format!("{name} (reverse)"),
                    reactants: rev_reactants,
                    products: rev_products,
                    fwd_rate: Some(rev),
                    rate_table: None,
                    radius: rd.radius,
                    intermembrane: rd.intermembrane,
                };
                check_surface_products(&rev_rule, &species)?;
                rules.push(rev_rule);
            }
        }

        let registry = Registry::new(species, rules)?;
        // `species` has moved into the registry; resolve names through it
        // from here on.
        let species_id = |name: &str| -> Result<SpeciesId, ModelError> {
            registry
                .species_id(name)
                .ok_or_else(|| ModelError::UnknownSpecies {
                    name: name.to_string(),
                })
        };

        let mut partition = Partition::new(
            DVec3::from_array(self.partition.min),
            DVec3::from_array(self.partition.max),
            self.partition.cell,
        )?;
        partition.bin_walls(&geometry);
        partition.compute_enclosure(&geometry);

        let mut releases = Vec::new();
        for rd in &self.releases {
            let sp = species_id(&rd.species)?;
            let site_name = rd.name.clone().unwrap_or_else(|| rd.species.clone());
            if Species::is_wildcard(sp) {
                return Err(ModelError::BadRelease {
                    site: site_name,
                    reason: "cannot release a wildcard species".to_string(),
                });
            }
            let kind = registry.species[sp].kind;
            let shape = match (&rd.shape, kind) {
                (ReleaseShapeDesc::Point { position }, SpeciesKind::Volume) => {
                    ReleaseShape::Point(DVec3::from_array(*position))
                }
                (ReleaseShapeDesc::Box { min, max }, SpeciesKind::Volume) => ReleaseShape::Box {
                    min: DVec3::from_array(*min),
                    max: DVec3::from_array(*max),
                },
                (ReleaseShapeDesc::Surface { object }, SpeciesKind::Surface) => {
                    ReleaseShape::Surface {
                        object: object_id(object)?,
                    }
                }
                (ReleaseShapeDesc::Surface { .. }, SpeciesKind::Volume) => {
                    return Err(ModelError::BadRelease {
                        site: site_name,
                        reason: "volume species cannot be released on a surface".to_string(),
                    })
                }
                (_, SpeciesKind::Surface) => {
                    return Err(ModelError::BadRelease {
                        site: site_name,
                        reason: "surface species must be released on a surface".to_string(),
                    })
                }
            };
            releases.push(ReleaseSite {
                name: site_name,
                species: sp,
                count: rd.count,
                shape,
                orient: rd.orient,
            });
        }

        let mut counts = Vec::new();
        for cd in &self.counts {
            let region = match &cd.region {
                None => CountRegion::World,
                Some(name) => CountRegion::Object(object_id(name)?),
            };
            counts.push(CountConfig {
                spec: CountSpec {
                    name: cd.name.clone(),
                    species: species_id(&cd.species)?,
                    region,
                },
                period: cd.period,
            });
        }

        Ok(RdSystem {
            registry,
            geometry,
            partition,
            dt: self.time_step,
            seed: self.seed,
            releases,
            counts,
            checkpoint: self.checkpoint.as_ref().map(|c| CheckpointPolicy {
                period: c.period,
                path: c.path.clone(),
            }),
        })
    }

    fn build_geometry(&self) -> Result<GeometryModel, ModelError> {
        let mut vertices = Vec::new();
        let mut tris = Vec::new();
        let mut names = Vec::new();
        for (o, od) in self.objects.iter().enumerate() {
            let offset = vertices.len();
            vertices.extend(od.vertices.iter().map(|&v| DVec3::from_array(v)));
            for &[a, b, c] in &od.walls {
                for local in [a, b, c] {
                    if local >= od.vertices.len() {
                        return Err(ModelError::BadVertexIndex {
                            object: od.name.clone(),
                            index: local,
                        });
                    }
                }
                tris.push(([offset + a, offset + b, offset + c], o, od.class, od.movable));
            }
            names.push(od.name.clone());
        }
        GeometryModel::build(vertices, tris, names)
    }
}

/// A rule creating a surface product must consume a surface reactant, so
/// product placement has a wall to anchor to.
fn check_surface_products(rule: &ReactionRule, species: &[Species]) -> Result<(), ModelError> {
    let any_surface_product = rule
        .products
        .iter()
        .any(|p| species[p.species].kind == SpeciesKind::Surface);
    let any_surface_reactant = rule
        .reactants
        .iter()
        .any(|r| species[r.species].kind == SpeciesKind::Surface);
    if any_surface_product && !any_surface_reactant {
        return Err(ModelError::SurfaceProductFromVolume {
            rule: rule.name.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"
name: minimal
time_step: 1.0e-6
seed: 17
partition:
  min: [0.0, 0.0, 0.0]
  max: [1.0, 1.0, 1.0]
  cell: 0.25
species:
  - name: A
    diffusion: 1.0e-6
  - name: B
    diffusion: 1.0e-6
  - name: R
    kind: surface
    diffusion_2d: 1.0e-8
objects:
  - name: membrane
    vertices:
      - [0.2, 0.2, 0.5]
      - [0.8, 0.2, 0.5]
      - [0.2, 0.8, 0.5]
    walls:
      - [0, 1, 2]
reactions:
  - reactants: ["A", "R'"]
    products: ["B", "R'"]
    rate: 1.0e6
    radius: 1.0e-3
    reverse_rate: 1.0e3
releases:
  - species: A
    count: 100
    shape:
      min: [0.1, 0.1, 0.1]
      max: [0.9, 0.9, 0.9]
  - species: R
    count: 10
    orient: Up
    shape:
      object: membrane
counts:
  - name: A_world
    species: A
    period: 1.0e-4
"#;

    #[test]
    fn yaml_model_resolves() {
        let desc = ModelDesc::from_yaml(MODEL).unwrap();
        let sys = desc.to_system().unwrap();
        // Three wildcards plus three declared species.
        assert_eq!(sys.registry.species.len(), 6);
        // Forward plus expanded reverse rule.
        assert_eq!(sys.registry.rules.len(), 2);
        assert_eq!(sys.registry.rules[1].fwd_rate, Some(1.0e3));
        assert_eq!(sys.releases.len(), 2);
        assert_eq!(sys.counts.len(), 1);
        assert_eq!(sys.seed, 17);
        assert_eq!(sys.geometry.objects[0].name, "membrane");
    }

    #[test]
    fn release_shapes_parse_from_their_fields() {
        let p: ReleaseShapeDesc = serde_yaml::from_str("position: [0.5, 0.5, 0.5]").unwrap();
        assert!(matches!(p, ReleaseShapeDesc::Point { .. }));
        let b: ReleaseShapeDesc =
            serde_yaml::from_str("min: [0.0, 0.0, 0.0]\nmax: [1.0, 1.0, 1.0]").unwrap();
        assert!(matches!(b, ReleaseShapeDesc::Box { .. }));
        let s: ReleaseShapeDesc = serde_yaml::from_str("object: membrane").unwrap();
        assert!(matches!(s, ReleaseShapeDesc::Surface { .. }));
    }

    #[test]
    fn orientation_marks_parse() {
        assert_eq!(parse_oriented("A'"), ("A", Orient::Up));
        assert_eq!(parse_oriented("A,"), ("A", Orient::Down));
        assert_eq!(parse_oriented("A"), ("A", Orient::None));
    }

    #[test]
    fn unknown_species_is_an_error() {
        let mut desc = ModelDesc::from_yaml(MODEL).unwrap();
        desc.counts[0].species = "Z".to_string();
        assert!(matches!(
            desc.to_system(),
            Err(ModelError::UnknownSpecies { .. })
        ));
    }

    #[test]
    fn wildcards_are_reserved_and_countable() {
        let mut desc = ModelDesc::from_yaml(MODEL).unwrap();
        desc.counts[0].species = "ALL_MOLECULES".to_string();
        assert!(desc.to_system().is_ok());

        desc.species.push(SpeciesDesc {
            name: "ALL_MOLECULES".to_string(),
            kind: SpeciesKind::Volume,
            diffusion_3d: 0.0,
            diffusion_2d: 0.0,
            count_enclosed: false,
            custom_time_step: None,
            custom_space_step: None,
        });
        assert!(matches!(
            desc.to_system(),
            Err(ModelError::ReservedName { .. })
        ));
    }

    #[test]
    fn surface_release_of_volume_species_is_rejected() {
        let mut desc = ModelDesc::from_yaml(MODEL).unwrap();
        desc.releases[1].species = "A".to_string();
        assert!(matches!(
            desc.to_system(),
            Err(ModelError::BadRelease { .. })
        ));
    }

    #[test]
    fn surface_product_needs_surface_reactant() {
        let mut desc = ModelDesc::from_yaml(MODEL).unwrap();
        desc.reactions.push(ReactionDesc {
            name: None,
            reactants: vec!["A".to_string(), "B".to_string()],
            products: vec!["R'".to_string()],
            rate: Some(1.0),
            rate_table: None,
            reverse_rate: None,
            radius: 1e-3,
            intermembrane: false,
        });
        assert!(matches!(
            desc.to_system(),
            Err(ModelError::SurfaceProductFromVolume { .. })
        ));
    }
}
