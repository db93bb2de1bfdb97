//! Triangulated surface geometry: walls, per-wall local frames, and the
//! segment/triangle tests the collision engine is built on.

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::base::{HashMapType, ObjectId, VertexId, WallId};
use crate::model::ModelError;

/// Tolerance for geometric degeneracy tests (zero-area triangles, parallel
/// rays).  Hits closer than this to a wall are treated as already on it.
pub const EPS_GEOM: f64 = 1e-12;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceClass {
    #[serde(alias = "reflective")]
    Reflective,
    #[serde(alias = "absorptive")]
    Absorptive,
    #[serde(alias = "transparent")]
    Transparent,
}

/// A single triangular wall.  The normal, area and local 2D frame are
/// precomputed from the vertex positions and kept consistent by
/// [`GeometryModel::refresh_wall`] whenever a vertex moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wall {
    pub verts: [VertexId; 3],
    pub object: ObjectId,
    pub class: SurfaceClass,
    pub movable: bool,
    /// Unit normal, oriented by vertex winding.
    pub normal: DVec3,
    pub area: f64,
    /// Local frame: `uhat` along the first edge, `vhat = normal × uhat`.
    pub uhat: DVec3,
    pub vhat: DVec3,
    /// Wall sharing edge i = (verts[i], verts[i+1 mod 3]), if any.
    pub neighbors: [Option<WallId>; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryObject {
    pub name: String,
    pub walls: Vec<WallId>,
    pub aabb: (DVec3, DVec3),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeometryModel {
    pub vertices: Vec<DVec3>,
    pub walls: Vec<Wall>,
    pub objects: Vec<GeometryObject>,
}

impl GeometryModel {
    /// Builds the model from per-object vertex/triangle soup, computing
    /// normals, areas, frames, edge neighbors and bounding boxes.  Degenerate
    /// triangles are a fatal build error.
    pub fn build(
        vertices: Vec<DVec3>,
        tris: Vec<([VertexId; 3], ObjectId, SurfaceClass, bool)>,
        object_names: Vec<String>,
    ) -> Result<Self, ModelError> {
        let mut model = GeometryModel {
            vertices,
            walls: Vec::with_capacity(tris.len()),
            objects: object_names
                .into_iter()
                .map(|name| GeometryObject {
                    name,
                    walls: Vec::new(),
                    aabb: (DVec3::ZERO, DVec3::ZERO),
                })
                .collect(),
        };

        for (verts, object, class, movable) in tris {
            for &v in &verts {
                if v >= model.vertices.len() {
                    return Err(ModelError::BadVertexIndex {
                        object: model.objects[object].name.clone(),
                        index: v,
                    });
                }
            }
            let id = model.walls.len();
            model.walls.push(Wall {
                verts,
                object,
                class,
                movable,
                normal: DVec3::ZERO,
                area: 0.,
                uhat: DVec3::ZERO,
                vhat: DVec3::ZERO,
                neighbors: [None; 3],
            });
            model.refresh_wall(id)?;
            model.objects[object].walls.push(id);
        }

        model.link_neighbors();
        for o in 0..model.objects.len() {
            model.refresh_object_aabb(o);
        }
        Ok(model)
    }

    /// Recomputes a wall's normal, area and frame from its vertices.
    pub fn refresh_wall(&mut self, w: WallId) -> Result<(), ModelError> {
        let [a, b, c] = self.wall_corners(w);
        let e1 = b - a;
        let e2 = c - a;
        let n = e1.cross(e2);
        let twice_area = n.length();
        if twice_area < EPS_GEOM {
            return Err(ModelError::DegenerateWall {
                object: self.objects[self.walls[w].object].name.clone(),
                wall: w,
            });
        }
        let wall = &mut self.walls[w];
        wall.normal = n / twice_area;
        wall.area = 0.5 * twice_area;
        wall.uhat = e1.normalize();
        wall.vhat = wall.normal.cross(wall.uhat);
        Ok(())
    }

    pub fn wall_corners(&self, w: WallId) -> [DVec3; 3] {
        let v = self.walls[w].verts;
        [self.vertices[v[0]], self.vertices[v[1]], self.vertices[v[2]]]
    }

    fn link_neighbors(&mut self) {
        let mut by_edge: HashMapType<(VertexId, VertexId), Vec<WallId>> = HashMapType::default();
        for (i, wall) in self.walls.iter().enumerate() {
            for e in 0..3 {
                let a = wall.verts[e];
                let b = wall.verts[(e + 1) % 3];
                by_edge.entry((a.min(b), a.max(b))).or_default().push(i);
            }
        }
        for i in 0..self.walls.len() {
            for e in 0..3 {
                let a = self.walls[i].verts[e];
                let b = self.walls[i].verts[(e + 1) % 3];
                let shared = &by_edge[&(a.min(b), a.max(b))];
                self.walls[i].neighbors[e] = shared.iter().copied().find(|&o| o != i);
            }
        }
    }

    fn refresh_object_aabb(&mut self, o: ObjectId) {
        let mut min = DVec3::splat(f64::INFINITY);
        let mut max = DVec3::splat(f64::NEG_INFINITY);
        for &w in &self.objects[o].walls {
            for p in self.wall_corners(w) {
                min = min.min(p);
                max = max.max(p);
            }
        }
        self.objects[o].aabb = (min, max);
    }

    pub fn wall_aabb(&self, w: WallId) -> (DVec3, DVec3) {
        let [a, b, c] = self.wall_corners(w);
        (a.min(b).min(c), a.max(b).max(c))
    }

    /// World position of a point given in a wall's local (u, v) frame.
    pub fn uv_to_world(&self, w: WallId, uv: DVec2) -> DVec3 {
        let wall = &self.walls[w];
        self.vertices[wall.verts[0]] + uv.x * wall.uhat + uv.y * wall.vhat
    }

    pub fn world_to_uv(&self, w: WallId, p: DVec3) -> DVec2 {
        let wall = &self.walls[w];
        let rel = p - self.vertices[wall.verts[0]];
        DVec2::new(rel.dot(wall.uhat), rel.dot(wall.vhat))
    }

    /// The wall's corners in its own local frame: (0,0), (|e1|,0), and the
    /// projection of the third vertex.
    pub fn corners_uv(&self, w: WallId) -> [DVec2; 3] {
        let [a, b, c] = self.wall_corners(w);
        let wall = &self.walls[w];
        [
            DVec2::ZERO,
            DVec2::new((b - a).length(), 0.),
            DVec2::new((c - a).dot(wall.uhat), (c - a).dot(wall.vhat)),
        ]
    }

    pub fn uv_inside(&self, w: WallId, uv: DVec2) -> bool {
        let [a, b, c] = self.corners_uv(w);
        point_in_tri_2d(uv, a, b, c, EPS_GEOM)
    }

    /// Ray-parity containment test against one object's walls.  Assumes the
    /// object is watertight; validation of that is an input-side concern.
    pub fn object_contains(&self, o: ObjectId, p: DVec3) -> bool {
        let (min, max) = self.objects[o].aabb;
        if p.cmplt(min).any() || p.cmpgt(max).any() {
            return false;
        }
        // Slightly irrational direction to avoid grazing edges exactly.
        let dir = DVec3::new(0.539_482_17, 0.707_296_53, 0.457_392_91).normalize();
        let reach = (max - min).length() + (p - min).length() + 1.0;
        let seg = dir * reach;
        let mut crossings = 0usize;
        for &w in &self.objects[o].walls {
            let [a, b, c] = self.wall_corners(w);
            if segment_tri_hit(p, seg, a, b, c).is_some() {
                crossings += 1;
            }
        }
        crossings % 2 == 1
    }

    /// Displaces vertices of movable walls and returns every wall pair left
    /// geometrically colliding by the move.  Walls whose vertices did not
    /// move but that now collide with a moved wall are reported too.
    pub fn apply_vertex_moves(
        &mut self,
        moves: &[(VertexId, DVec3)],
    ) -> Result<Vec<(WallId, WallId)>, ModelError> {
        let mut moved_verts: Vec<VertexId> = Vec::with_capacity(moves.len());
        for &(v, disp) in moves {
            if v >= self.vertices.len() {
                return Err(ModelError::BadVertexIndex {
                    object: String::from("<vertex move>"),
                    index: v,
                });
            }
            self.vertices[v] += disp;
            moved_verts.push(v);
        }
        moved_verts.sort_unstable();
        moved_verts.dedup();

        let mut affected: Vec<WallId> = Vec::new();
        for (i, wall) in self.walls.iter().enumerate() {
            if wall.verts.iter().any(|v| moved_verts.binary_search(v).is_ok()) {
                if !wall.movable {
                    return Err(ModelError::ImmovableWall {
                        object: self.objects[wall.object].name.clone(),
                        wall: i,
                    });
                }
                affected.push(i);
            }
        }
        for &w in &affected {
            self.refresh_wall(w)?;
        }
        let objects: Vec<ObjectId> = {
            let mut o: Vec<_> = affected.iter().map(|&w| self.walls[w].object).collect();
            o.sort_unstable();
            o.dedup();
            o
        };
        for o in objects {
            self.refresh_object_aabb(o);
        }

        let mut pairs = Vec::new();
        for &w in &affected {
            let (wmin, wmax) = self.wall_aabb(w);
            let wc = self.wall_corners(w);
            for x in 0..self.walls.len() {
                if x == w {
                    continue;
                }
                // Walls sharing a vertex touch by construction; only true
                // interpenetration counts.
                if self.walls[x]
                    .verts
                    .iter()
                    .any(|v| self.walls[w].verts.contains(v))
                {
                    continue;
                }
                let (xmin, xmax) = self.wall_aabb(x);
                if wmin.cmpgt(xmax + EPS_GEOM).any() || wmax.cmplt(xmin - EPS_GEOM).any() {
                    continue;
                }
                if tri_tri_collide(wc, self.wall_corners(x)) {
                    pairs.push((w.min(x), w.max(x)));
                }
            }
        }
        pairs.sort_unstable();
        pairs.dedup();
        Ok(pairs)
    }
}

/// Möller–Trumbore segment/triangle intersection.  Returns the fraction of
/// `disp` at which the segment starting at `p` crosses triangle `(a, b, c)`,
/// for hits strictly after the start and no later than the full displacement.
/// Degenerate triangles and displacements parallel to the plane report no
/// hit.
pub fn segment_tri_hit(p: DVec3, disp: DVec3, a: DVec3, b: DVec3, c: DVec3) -> Option<f64> {
    let e1 = b - a;
    let e2 = c - a;
    let pv = disp.cross(e2);
    let det = e1.dot(pv);
    if det.abs() < EPS_GEOM {
        return None;
    }
    let inv = 1.0 / det;
    let tv = p - a;
    let u = tv.dot(pv) * inv;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let qv = tv.cross(e1);
    let v = disp.dot(qv) * inv;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(qv) * inv;
    if t > EPS_GEOM && t <= 1.0 {
        Some(t)
    } else {
        None
    }
}

/// Point of closest approach of the static point `q` to the segment
/// `p .. p + d`.  Returns the segment fraction and the squared distance.
pub fn closest_approach(p: DVec3, d: DVec3, q: DVec3) -> (f64, f64) {
    let len2 = d.length_squared();
    if len2 < EPS_GEOM * EPS_GEOM {
        return (0.0, (q - p).length_squared());
    }
    let t = ((q - p).dot(d) / len2).clamp(0.0, 1.0);
    (t, (p + t * d - q).length_squared())
}

fn orient_2d(a: DVec2, b: DVec2, p: DVec2) -> f64 {
    (b - a).perp_dot(p - a)
}

/// Strict interior test; points on the boundary are outside.
pub fn point_strictly_in_tri_2d(p: DVec2, a: DVec2, b: DVec2, c: DVec2, eps: f64) -> bool {
    let s1 = orient_2d(a, b, p);
    let s2 = orient_2d(b, c, p);
    let s3 = orient_2d(c, a, p);
    (s1 > eps && s2 > eps && s3 > eps) || (s1 < -eps && s2 < -eps && s3 < -eps)
}

/// Inclusive interior test (boundary counts), used for surface molecule
/// containment.
pub fn point_in_tri_2d(p: DVec2, a: DVec2, b: DVec2, c: DVec2, eps: f64) -> bool {
    let s1 = orient_2d(a, b, p);
    let s2 = orient_2d(b, c, p);
    let s3 = orient_2d(c, a, p);
    (s1 >= -eps && s2 >= -eps && s3 >= -eps) || (s1 <= eps && s2 <= eps && s3 <= eps)
}

fn proper_cross_2d(p1: DVec2, p2: DVec2, q1: DVec2, q2: DVec2, eps: f64) -> bool {
    let d1 = orient_2d(p1, p2, q1);
    let d2 = orient_2d(p1, p2, q2);
    let d3 = orient_2d(q1, q2, p1);
    let d4 = orient_2d(q1, q2, p2);
    ((d1 > eps && d2 < -eps) || (d1 < -eps && d2 > eps))
        && ((d3 > eps && d4 < -eps) || (d3 < -eps && d4 > eps))
}

fn project_2d(tri: [DVec3; 3], normal: DVec3) -> [DVec2; 3] {
    let n = normal.abs();
    let drop = if n.x >= n.y && n.x >= n.z {
        0
    } else if n.y >= n.z {
        1
    } else {
        2
    };
    tri.map(|p| match drop {
        0 => DVec2::new(p.y, p.z),
        1 => DVec2::new(p.x, p.z),
        _ => DVec2::new(p.x, p.y),
    })
}

/// Area overlap of two coplanar triangles.  Boundary-only contact (a shared
/// edge or a single shared vertex) does not count as overlap.
pub fn coplanar_tri_overlap(t1: [DVec3; 3], t2: [DVec3; 3]) -> bool {
    let n = (t1[1] - t1[0]).cross(t1[2] - t1[0]);
    if n.length() < EPS_GEOM {
        return false;
    }
    let a = project_2d(t1, n);
    let b = project_2d(t2, n);
    let eps = EPS_GEOM;

    for p in b {
        if point_strictly_in_tri_2d(p, a[0], a[1], a[2], eps) {
            return true;
        }
    }
    for p in a {
        if point_strictly_in_tri_2d(p, b[0], b[1], b[2], eps) {
            return true;
        }
    }
    for i in 0..3 {
        for j in 0..3 {
            if proper_cross_2d(a[i], a[(i + 1) % 3], b[j], b[(j + 1) % 3], eps) {
                return true;
            }
        }
    }
    // Identical or edge-collinear overlaps have no strict vertex containment
    // and no proper crossings; the centroids decide.
    let ca = (a[0] + a[1] + a[2]) / 3.0;
    let cb = (b[0] + b[1] + b[2]) / 3.0;
    point_strictly_in_tri_2d(ca, b[0], b[1], b[2], eps)
        || point_strictly_in_tri_2d(cb, a[0], a[1], a[2], eps)
}

/// Full triangle/triangle collision: coplanar pairs use the area-overlap
/// test, transversal pairs look for an edge of one piercing the other.
pub fn tri_tri_collide(t1: [DVec3; 3], t2: [DVec3; 3]) -> bool {
    let n1 = (t1[1] - t1[0]).cross(t1[2] - t1[0]);
    let n2 = (t2[1] - t2[0]).cross(t2[2] - t2[0]);
    if n1.length() < EPS_GEOM || n2.length() < EPS_GEOM {
        return false;
    }
    let n1u = n1.normalize();
    let coplanar = n1u.cross(n2.normalize()).length() < 1e-9
        && (t2[0] - t1[0]).dot(n1u).abs() < 1e-9;
    if coplanar {
        return coplanar_tri_overlap(t1, t2);
    }
    for tri in [(t1, t2), (t2, t1)] {
        let (from, against) = tri;
        for i in 0..3 {
            let p = from[i];
            let d = from[(i + 1) % 3] - p;
            if let Some(t) = segment_tri_hit(p, d, against[0], against[1], against[2]) {
                if t > EPS_GEOM && t < 1.0 - EPS_GEOM {
                    return true;
                }
            }
        }
    }
    false
}

/// Axis-aligned cube triangulated into 12 walls, for tests across modules.
#[cfg(test)]
pub(crate) fn test_cube(origin: DVec3, size: f64) -> GeometryModel {
    test_cube_with_class(origin, size, SurfaceClass::Reflective)
}

#[cfg(test)]
pub(crate) fn test_cube_with_class(
    origin: DVec3,
    size: f64,
    class: SurfaceClass,
) -> GeometryModel {
    let verts: Vec<DVec3> = (0..8)
        .map(|i| {
            origin
                + DVec3::new(
                    size * ((i & 1) as f64),
                    size * (((i >> 1) & 1) as f64),
                    size * (((i >> 2) & 1) as f64),
                )
        })
        .collect();
    let faces: [[usize; 3]; 12] = [
        [0, 2, 1],
        [1, 2, 3],
        [4, 5, 6],
        [5, 7, 6],
        [0, 1, 4],
        [1, 5, 4],
        [2, 6, 3],
        [3, 6, 7],
        [0, 4, 2],
        [2, 4, 6],
        [1, 3, 5],
        [3, 7, 5],
    ];
    GeometryModel::build(
        verts,
        faces
            .iter()
            .map(|&f| (f, 0usize, class, true))
            .collect(),
        vec!["box".to_string()],
    )
    .unwrap()
}
