//! Deterministic in-memory kernel
//!
//! Produces synthetic but self-consistent topology (vertex positions, edge
//! lengths, face areas and normals, solid volumes) without any real B-Rep
//! library. Identical requests always yield identical shape ids, which makes
//! it suitable for exercising caching and selection logic, and it records
//! every construction call so tests can count them.

use std::collections::{HashMap, HashSet};
use std::f64::consts::{PI, TAU};

use glam::{DQuat, DVec3};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    Axis3D, BooleanType, CadError, CadKernel, CadResult, EntityKind, KernelOp, QuantityKind,
    Shape, ShapeSummary,
};
use crate::hash::HashBuilder;

/// Lengths below this are treated as zero
const EPS: f64 = 1e-9;

/// One synthetic sub-entity
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StubEntity {
    centroid: DVec3,
    /// Face normal, circle plane normal for edges, zero otherwise
    normal: DVec3,
    /// Length, area or volume depending on the entity kind
    size: f64,
}

impl StubEntity {
    fn new(centroid: DVec3, normal: DVec3, size: f64) -> Self {
        Self {
            centroid,
            normal,
            size,
        }
    }

    fn point(centroid: DVec3) -> Self {
        Self::new(centroid, DVec3::ZERO, 0.0)
    }

    fn transformed(&self, rotation: DQuat, pivot: DVec3, translation: DVec3) -> Self {
        Self {
            centroid: rotation * (self.centroid - pivot) + pivot + translation,
            normal: rotation * self.normal,
            size: self.size,
        }
    }
}

/// Kernel-side storage for one shape
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StubShape {
    wires: u32,
    closed_wires: u32,
    shells: u32,
    vertices: Vec<StubEntity>,
    edges: Vec<StubEntity>,
    faces: Vec<StubEntity>,
    solids: Vec<StubEntity>,
    /// Area enclosed by a closed planar profile
    enclosed_area: f64,
    /// Centroid of the profile or shape
    centroid: DVec3,
    /// Plane normal of a planar profile
    plane_normal: DVec3,
}

impl StubShape {
    fn summary(&self) -> ShapeSummary {
        ShapeSummary {
            vertices: self.vertices.len() as u32,
            edges: self.edges.len() as u32,
            wires: self.wires,
            closed_wires: self.closed_wires,
            faces: self.faces.len() as u32,
            shells: self.shells,
            solids: self.solids.len() as u32,
        }
    }

    fn entities(&self, kind: EntityKind) -> &[StubEntity] {
        match kind {
            EntityKind::Vertex => &self.vertices,
            EntityKind::Edge => &self.edges,
            EntityKind::Face => &self.faces,
            EntityKind::Solid => &self.solids,
        }
    }

    fn is_profile(&self) -> bool {
        self.solids.is_empty() && (self.wires > 0 || self.faces.len() == 1)
    }

    fn is_closed_profile(&self) -> bool {
        self.solids.is_empty() && (self.closed_wires > 0 || self.faces.len() == 1)
    }

    fn volume(&self) -> f64 {
        self.solids.iter().map(|s| s.size).sum()
    }

    /// Axis-aligned bounds over every located entity
    fn bounds(&self) -> (DVec3, DVec3) {
        let mut min = DVec3::splat(f64::INFINITY);
        let mut max = DVec3::splat(f64::NEG_INFINITY);
        for entity in self
            .vertices
            .iter()
            .chain(self.edges.iter())
            .chain(self.faces.iter())
        {
            min = min.min(entity.centroid);
            max = max.max(entity.centroid);
        }
        if min.x > max.x {
            (self.centroid, self.centroid)
        } else {
            (min, max)
        }
    }

    fn transformed(&self, rotation: DQuat, pivot: DVec3, translation: DVec3) -> Self {
        let map = |list: &[StubEntity]| {
            list.iter()
                .map(|e| e.transformed(rotation, pivot, translation))
                .collect::<Vec<_>>()
        };
        Self {
            wires: self.wires,
            closed_wires: self.closed_wires,
            shells: self.shells,
            vertices: map(&self.vertices),
            edges: map(&self.edges),
            faces: map(&self.faces),
            solids: map(&self.solids),
            enclosed_area: self.enclosed_area,
            centroid: rotation * (self.centroid - pivot) + pivot + translation,
            plane_normal: rotation * self.plane_normal,
        }
    }
}

/// Deterministic kernel backed by synthetic topology
#[derive(Default)]
pub struct StubKernel {
    /// Storage for shape data (keyed by UUID)
    shapes: Mutex<HashMap<Uuid, StubShape>>,
    /// Tags of every construction call, in order
    calls: Mutex<Vec<&'static str>>,
    /// Operation tags that always fail
    failing: HashSet<&'static str>,
}

impl StubKernel {
    /// Create a new stub kernel
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation with this tag fail
    pub fn with_failure(mut self, tag: &'static str) -> Self {
        self.failing.insert(tag);
        self
    }

    /// Number of construction calls so far
    pub fn build_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of construction calls with the given operation tag
    pub fn build_calls_for(&self, tag: &str) -> usize {
        self.calls.lock().iter().filter(|t| **t == tag).count()
    }

    /// Tags of all construction calls, in order
    pub fn call_log(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    /// Forget recorded calls
    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of stored shapes
    pub fn shape_count(&self) -> usize {
        self.shapes.lock().len()
    }

    fn get(&self, shape: &Shape) -> CadResult<StubShape> {
        self.shapes
            .lock()
            .get(&shape.id)
            .cloned()
            .ok_or(CadError::UnknownShape(shape.id))
    }

    fn store(&self, id: Uuid, shape: StubShape) -> Shape {
        self.shapes.lock().insert(id, shape);
        Shape::new(id)
    }

    fn construct(&self, op: &KernelOp<'_>) -> CadResult<StubShape> {
        match op {
            KernelOp::Box {
                origin,
                extent,
                centered,
            } => make_box(*origin, *extent, *centered),
            KernelOp::Cylinder {
                p0,
                p1,
                radius,
                inner_radius,
            } => make_cylinder(*p0, *p1, *radius, *inner_radius),
            KernelOp::Sphere { center, radius } => make_sphere(*center, *radius),
            KernelOp::Polyline { points, closed } => make_polyline(points, *closed),
            KernelOp::Circle {
                center,
                normal,
                radius,
            } => make_circle(*center, *normal, *radius),
            KernelOp::Extrude {
                profile,
                direction,
                symmetric,
            } => extrude(&self.get(profile)?, *direction, *symmetric),
            KernelOp::Revolve {
                profile,
                axis,
                angle,
            } => revolve(&self.get(profile)?, axis, *angle),
            KernelOp::Sweep { profile, path } => sweep(&self.get(profile)?, &self.get(path)?),
            KernelOp::Loft {
                profiles,
                ruled: _,
                solid,
            } => {
                let sections = profiles
                    .iter()
                    .map(|p| self.get(p))
                    .collect::<CadResult<Vec<_>>>()?;
                loft(&sections, *solid)
            }
            KernelOp::Boolean { target, tool, op } => {
                boolean(&self.get(target)?, &self.get(tool)?, *op)
            }
            KernelOp::Fillet {
                body,
                edges,
                radius,
            } => round_edges(&self.get(body)?, edges, *radius, EdgeTreatment::Fillet),
            KernelOp::Chamfer {
                body,
                edges,
                distance,
            } => round_edges(&self.get(body)?, edges, *distance, EdgeTreatment::Chamfer),
            KernelOp::Shell {
                body,
                faces_to_remove,
                thickness,
            } => shell(&self.get(body)?, faces_to_remove, *thickness),
            KernelOp::Transform {
                body,
                translation,
                rotation,
            } => {
                let source = self.get(body)?;
                Ok(match rotation {
                    Some((axis, angle)) => source.transformed(
                        DQuat::from_axis_angle(axis.direction, *angle),
                        axis.origin,
                        *translation,
                    ),
                    None => source.transformed(DQuat::IDENTITY, DVec3::ZERO, *translation),
                })
            }
            KernelOp::Compound { parts } => {
                let parts = parts
                    .iter()
                    .map(|p| self.get(p))
                    .collect::<CadResult<Vec<_>>>()?;
                compound(&parts)
            }
        }
    }
}

impl CadKernel for StubKernel {
    fn name(&self) -> &str {
        "stub"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn build(&self, op: &KernelOp<'_>) -> CadResult<Shape> {
        let tag = op.tag();
        self.calls.lock().push(tag);

        if self.failing.contains(tag) {
            return Err(CadError::OperationFailed(format!(
                "{} rejected by stub kernel",
                tag
            )));
        }

        let shape = self.construct(op)?;
        Ok(self.store(op_identity(op), shape))
    }

    fn summarize(&self, shape: &Shape) -> CadResult<ShapeSummary> {
        Ok(self.get(shape)?.summary())
    }

    fn sub_entities(&self, shape: &Shape, kind: EntityKind) -> CadResult<Vec<u32>> {
        let shapes = self.shapes.lock();
        let data = shapes
            .get(&shape.id)
            .ok_or(CadError::UnknownShape(shape.id))?;
        Ok((0..data.entities(kind).len() as u32).collect())
    }

    fn measure(
        &self,
        shape: &Shape,
        quantity: QuantityKind,
        kind: EntityKind,
        index: u32,
    ) -> CadResult<f64> {
        let shapes = self.shapes.lock();
        let data = shapes
            .get(&shape.id)
            .ok_or(CadError::UnknownShape(shape.id))?;
        let entity = data
            .entities(kind)
            .get(index as usize)
            .ok_or(CadError::InvalidEntity { kind, index })?;

        let undefined = CadError::UndefinedQuantity { quantity, kind };
        match quantity {
            QuantityKind::Length if kind == EntityKind::Edge => Ok(entity.size),
            QuantityKind::Area if kind == EntityKind::Face => Ok(entity.size),
            QuantityKind::Volume if kind == EntityKind::Solid => Ok(entity.size),
            QuantityKind::Length | QuantityKind::Area | QuantityKind::Volume => Err(undefined),
            QuantityKind::CentroidX => Ok(entity.centroid.x),
            QuantityKind::CentroidY => Ok(entity.centroid.y),
            QuantityKind::CentroidZ => Ok(entity.centroid.z),
            QuantityKind::NormalX | QuantityKind::NormalY | QuantityKind::NormalZ
                if kind == EntityKind::Vertex || kind == EntityKind::Solid =>
            {
                Err(undefined)
            }
            QuantityKind::NormalX => Ok(entity.normal.x),
            QuantityKind::NormalY => Ok(entity.normal.y),
            QuantityKind::NormalZ => Ok(entity.normal.z),
        }
    }

    fn export_shape(&self, shape: &Shape) -> CadResult<Vec<u8>> {
        let data = self.get(shape)?;
        ron::to_string(&data)
            .map(String::into_bytes)
            .map_err(|e| CadError::Serialization(e.to_string()))
    }

    fn import_shape(&self, bytes: &[u8]) -> CadResult<Shape> {
        let text =
            std::str::from_utf8(bytes).map_err(|e| CadError::Serialization(e.to_string()))?;
        let data: StubShape =
            ron::from_str(text).map_err(|e| CadError::Serialization(e.to_string()))?;
        let digest = HashBuilder::new("import").write_str(text).finish();
        Ok(self.store(uuid_from_digest(digest.as_bytes()), data))
    }
}

/// Shape id derived from the request, so identical requests give identical ids
fn op_identity(op: &KernelOp<'_>) -> Uuid {
    fn shape(h: &mut HashBuilder, s: &Shape) {
        h.write_str(&s.id.to_string());
    }

    let mut h = HashBuilder::new(op.tag());
    match op {
        KernelOp::Box {
            origin,
            extent,
            centered,
        } => {
            h.write_vec3(*origin).write_vec3(*extent).write_bool(*centered);
        }
        KernelOp::Cylinder {
            p0,
            p1,
            radius,
            inner_radius,
        } => {
            h.write_vec3(*p0).write_vec3(*p1).write_f64(*radius);
            h.write_f64(inner_radius.unwrap_or(-1.0));
        }
        KernelOp::Sphere { center, radius } => {
            h.write_vec3(*center).write_f64(*radius);
        }
        KernelOp::Polyline { points, closed } => {
            h.write_bool(*closed).write_u64(points.len() as u64);
            for p in points {
                h.write_vec3(*p);
            }
        }
        KernelOp::Circle {
            center,
            normal,
            radius,
        } => {
            h.write_vec3(*center).write_vec3(*normal).write_f64(*radius);
        }
        KernelOp::Extrude {
            profile,
            direction,
            symmetric,
        } => {
            shape(&mut h, profile);
            h.write_vec3(*direction).write_bool(*symmetric);
        }
        KernelOp::Revolve {
            profile,
            axis,
            angle,
        } => {
            shape(&mut h, profile);
            h.write_vec3(axis.origin)
                .write_vec3(axis.direction)
                .write_f64(*angle);
        }
        KernelOp::Sweep { profile, path } => {
            shape(&mut h, profile);
            shape(&mut h, path);
        }
        KernelOp::Loft {
            profiles,
            ruled,
            solid,
        } => {
            for p in profiles {
                shape(&mut h, p);
            }
            h.write_bool(*ruled).write_bool(*solid);
        }
        KernelOp::Boolean { target, tool, op } => {
            shape(&mut h, target);
            shape(&mut h, tool);
            h.write_str(op.tag());
        }
        KernelOp::Fillet {
            body,
            edges,
            radius: size,
        }
        | KernelOp::Chamfer {
            body,
            edges,
            distance: size,
        } => {
            shape(&mut h, body);
            for e in edges.iter() {
                h.write_u32(*e);
            }
            h.write_f64(*size);
        }
        KernelOp::Shell {
            body,
            faces_to_remove,
            thickness,
        } => {
            shape(&mut h, body);
            for f in faces_to_remove.iter() {
                h.write_u32(*f);
            }
            h.write_f64(*thickness);
        }
        KernelOp::Transform {
            body,
            translation,
            rotation,
        } => {
            shape(&mut h, body);
            h.write_vec3(*translation);
            if let Some((axis, angle)) = rotation {
                h.write_vec3(axis.origin)
                    .write_vec3(axis.direction)
                    .write_f64(*angle);
            }
        }
        KernelOp::Compound { parts } => {
            for p in parts {
                shape(&mut h, p);
            }
        }
    }
    uuid_from_digest(h.finish().as_bytes())
}

fn uuid_from_digest(digest: &[u8; 32]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Some unit vector perpendicular to `n`
fn perpendicular(n: DVec3) -> DVec3 {
    if n.x.abs() < 0.9 {
        n.cross(DVec3::X).normalize_or_zero()
    } else {
        n.cross(DVec3::Y).normalize_or_zero()
    }
}

/// Newell normal scaled by twice the enclosed area
fn newell(points: &[DVec3]) -> DVec3 {
    let n = points.len();
    (0..n).fold(DVec3::ZERO, |acc, i| {
        acc + points[i].cross(points[(i + 1) % n])
    })
}

fn centroid_of(points: impl Iterator<Item = DVec3>) -> DVec3 {
    let (sum, count) = points.fold((DVec3::ZERO, 0usize), |(s, c), p| (s + p, c + 1));
    if count == 0 {
        DVec3::ZERO
    } else {
        sum / count as f64
    }
}

fn make_box(origin: DVec3, extent: DVec3, centered: bool) -> CadResult<StubShape> {
    if extent.abs().min_element() < EPS {
        return Err(CadError::Degenerate("box with zero extent".into()));
    }

    let start = if centered { origin - extent * 0.5 } else { origin };
    let lo = start.min(start + extent);
    let size = extent.abs();
    let center = lo + size * 0.5;
    let axes = [DVec3::X, DVec3::Y, DVec3::Z];

    let vertices = (0..8)
        .map(|i| {
            let corner = DVec3::new(
                (i & 1) as f64,
                ((i >> 1) & 1) as f64,
                ((i >> 2) & 1) as f64,
            );
            StubEntity::point(lo + size * corner)
        })
        .collect();

    let mut edges = Vec::with_capacity(12);
    let mut faces = Vec::with_capacity(6);
    for a in 0..3 {
        let (b, c) = ((a + 1) % 3, (a + 2) % 3);
        for (sb, sc) in [(-0.5, -0.5), (0.5, -0.5), (-0.5, 0.5), (0.5, 0.5)] {
            let offset = axes[b] * size[b] * sb + axes[c] * size[c] * sc;
            edges.push(StubEntity::new(center + offset, DVec3::ZERO, size[a]));
        }
        for sign in [-1.0, 1.0] {
            faces.push(StubEntity::new(
                center + axes[a] * size[a] * 0.5 * sign,
                axes[a] * sign,
                size[b] * size[c],
            ));
        }
    }

    Ok(StubShape {
        wires: 6,
        closed_wires: 6,
        shells: 1,
        vertices,
        edges,
        faces,
        solids: vec![StubEntity::new(
            center,
            DVec3::ZERO,
            size.x * size.y * size.z,
        )],
        enclosed_area: 0.0,
        centroid: center,
        plane_normal: DVec3::ZERO,
    })
}

fn make_cylinder(p0: DVec3, p1: DVec3, radius: f64, inner: Option<f64>) -> CadResult<StubShape> {
    let axis = p1 - p0;
    let height = axis.length();
    if height < EPS || radius <= EPS {
        return Err(CadError::Degenerate(
            "cylinder needs positive height and radius".into(),
        ));
    }
    if let Some(ri) = inner
        && (ri <= EPS || ri >= radius)
    {
        return Err(CadError::Degenerate(format!(
            "inner radius {} must lie in (0, {})",
            ri, radius
        )));
    }

    let n = axis / height;
    let perp = perpendicular(n);
    let mid = (p0 + p1) * 0.5;
    let ri = inner.unwrap_or(0.0);

    let mut vertices = vec![
        StubEntity::point(p0 + perp * radius),
        StubEntity::point(p1 + perp * radius),
    ];
    let mut edges = vec![
        StubEntity::new(p0, n, TAU * radius),
        StubEntity::new(p1, n, TAU * radius),
        StubEntity::new(mid + perp * radius, DVec3::ZERO, height),
    ];
    let ring = PI * (radius * radius - ri * ri);
    let mut faces = vec![
        StubEntity::new(p0, -n, ring),
        StubEntity::new(p1, n, ring),
        StubEntity::new(mid + perp * radius, perp, TAU * radius * height),
    ];
    if inner.is_some() {
        vertices.push(StubEntity::point(p0 + perp * ri));
        vertices.push(StubEntity::point(p1 + perp * ri));
        edges.push(StubEntity::new(p0, n, TAU * ri));
        edges.push(StubEntity::new(p1, n, TAU * ri));
        edges.push(StubEntity::new(mid + perp * ri, DVec3::ZERO, height));
        faces.push(StubEntity::new(mid + perp * ri, -perp, TAU * ri * height));
    }

    let face_count = faces.len() as u32;
    Ok(StubShape {
        wires: face_count,
        closed_wires: face_count,
        shells: 1,
        vertices,
        edges,
        faces,
        solids: vec![StubEntity::new(mid, DVec3::ZERO, ring * height)],
        enclosed_area: 0.0,
        centroid: mid,
        plane_normal: DVec3::ZERO,
    })
}

fn make_sphere(center: DVec3, radius: f64) -> CadResult<StubShape> {
    if radius <= EPS {
        return Err(CadError::Degenerate("sphere radius must be positive".into()));
    }
    Ok(StubShape {
        wires: 1,
        closed_wires: 1,
        shells: 1,
        vertices: vec![
            StubEntity::point(center + DVec3::Z * radius),
            StubEntity::point(center - DVec3::Z * radius),
        ],
        edges: vec![StubEntity::new(
            center + DVec3::X * radius,
            DVec3::ZERO,
            PI * radius,
        )],
        faces: vec![StubEntity::new(
            center,
            DVec3::Z,
            4.0 * PI * radius * radius,
        )],
        solids: vec![StubEntity::new(
            center,
            DVec3::ZERO,
            4.0 / 3.0 * PI * radius.powi(3),
        )],
        enclosed_area: 0.0,
        centroid: center,
        plane_normal: DVec3::ZERO,
    })
}

fn make_polyline(points: &[DVec3], closed: bool) -> CadResult<StubShape> {
    let min_points = if closed { 3 } else { 2 };
    if points.len() < min_points {
        return Err(CadError::InvalidProfile(format!(
            "{} polyline needs at least {} points",
            if closed { "closed" } else { "open" },
            min_points
        )));
    }

    let n = points.len();
    let segments = if closed { n } else { n - 1 };
    let mut edges = Vec::with_capacity(segments);
    for i in 0..segments {
        let (a, b) = (points[i], points[(i + 1) % n]);
        let length = (b - a).length();
        if length < EPS {
            return Err(CadError::Degenerate(format!(
                "zero-length segment at point {}",
                i
            )));
        }
        edges.push(StubEntity::new((a + b) * 0.5, DVec3::ZERO, length));
    }

    let (enclosed_area, plane_normal) = if closed {
        let normal = newell(points);
        (normal.length() * 0.5, normal.normalize_or_zero())
    } else {
        (0.0, DVec3::ZERO)
    };

    Ok(StubShape {
        wires: 1,
        closed_wires: u32::from(closed),
        shells: 0,
        vertices: points.iter().copied().map(StubEntity::point).collect(),
        edges,
        faces: Vec::new(),
        solids: Vec::new(),
        enclosed_area,
        centroid: centroid_of(points.iter().copied()),
        plane_normal,
    })
}

fn make_circle(center: DVec3, normal: DVec3, radius: f64) -> CadResult<StubShape> {
    let n = normal.normalize_or_zero();
    if radius <= EPS || n == DVec3::ZERO {
        return Err(CadError::Degenerate(
            "circle needs a positive radius and a normal".into(),
        ));
    }
    Ok(StubShape {
        wires: 1,
        closed_wires: 1,
        shells: 0,
        vertices: vec![StubEntity::point(center + perpendicular(n) * radius)],
        edges: vec![StubEntity::new(center, n, TAU * radius)],
        faces: Vec::new(),
        solids: Vec::new(),
        enclosed_area: PI * radius * radius,
        centroid: center,
        plane_normal: n,
    })
}

fn extrude(profile: &StubShape, direction: DVec3, symmetric: bool) -> CadResult<StubShape> {
    if !profile.is_profile() {
        return Err(CadError::InvalidProfile(
            "extrusion profile must be a wire or a single face".into(),
        ));
    }
    let length = direction.length();
    if length < EPS {
        return Err(CadError::Degenerate("zero extrusion direction".into()));
    }

    let dir_n = direction / length;
    let shift = if symmetric {
        -direction * 0.5
    } else {
        DVec3::ZERO
    };
    let closed = profile.is_closed_profile();
    let outward = |p: DVec3| {
        let radial = p - profile.centroid;
        let radial = radial - dir_n * radial.dot(dir_n);
        radial.try_normalize().unwrap_or_else(|| perpendicular(dir_n))
    };

    let mut faces: Vec<StubEntity> = profile
        .edges
        .iter()
        .map(|e| {
            StubEntity::new(
                e.centroid + shift + direction * 0.5,
                outward(e.centroid),
                e.size * length,
            )
        })
        .collect();

    let mut vertices = Vec::with_capacity(profile.vertices.len() * 2);
    let mut edges = Vec::with_capacity(profile.edges.len() * 2 + profile.vertices.len());
    for end in [shift, shift + direction] {
        vertices.extend(
            profile
                .vertices
                .iter()
                .map(|v| StubEntity::point(v.centroid + end)),
        );
        edges.extend(
            profile
                .edges
                .iter()
                .map(|e| StubEntity::new(e.centroid + end, e.normal, e.size)),
        );
    }
    edges.extend(profile.vertices.iter().map(|v| {
        StubEntity::new(v.centroid + shift + direction * 0.5, DVec3::ZERO, length)
    }));

    let mut solids = Vec::new();
    if closed {
        let area = profile.enclosed_area;
        faces.push(StubEntity::new(profile.centroid + shift, -dir_n, area));
        faces.push(StubEntity::new(
            profile.centroid + shift + direction,
            dir_n,
            area,
        ));
        let height = if profile.plane_normal == DVec3::ZERO {
            length
        } else {
            direction.dot(profile.plane_normal).abs()
        };
        solids.push(StubEntity::new(
            profile.centroid + shift + direction * 0.5,
            DVec3::ZERO,
            area * height,
        ));
    }

    let face_count = faces.len() as u32;
    Ok(StubShape {
        wires: face_count,
        closed_wires: face_count,
        shells: 1,
        vertices,
        edges,
        faces,
        solids,
        enclosed_area: 0.0,
        centroid: profile.centroid + shift + direction * 0.5,
        plane_normal: DVec3::ZERO,
    })
}

fn revolve(profile: &StubShape, axis: &Axis3D, angle: f64) -> CadResult<StubShape> {
    if !profile.is_profile() {
        return Err(CadError::InvalidProfile(
            "revolution profile must be a wire or a single face".into(),
        ));
    }
    if angle.abs() < EPS || axis.direction == DVec3::ZERO {
        return Err(CadError::Degenerate(
            "revolution needs a non-zero angle and axis".into(),
        ));
    }

    let sweep = angle.abs().min(TAU);
    let half_turn = DQuat::from_axis_angle(axis.direction, angle * 0.5);
    let radius_of = |p: DVec3| {
        let r = p - axis.origin;
        (r - axis.direction * r.dot(axis.direction)).length()
    };
    let place = |p: DVec3| half_turn * (p - axis.origin) + axis.origin;

    let mut faces: Vec<StubEntity> = profile
        .edges
        .iter()
        .map(|e| {
            let c = place(e.centroid);
            let normal = (c - axis.origin)
                .reject_from_normalized(axis.direction)
                .normalize_or_zero();
            StubEntity::new(c, normal, e.size * radius_of(e.centroid) * sweep)
        })
        .collect();
    let mut edges: Vec<StubEntity> = profile
        .vertices
        .iter()
        .map(|v| {
            StubEntity::new(
                place(v.centroid),
                axis.direction,
                radius_of(v.centroid) * sweep,
            )
        })
        .collect();
    edges.extend(profile.edges.iter().cloned());

    let partial = sweep < TAU - EPS;
    let closed = profile.is_closed_profile();
    let mut solids = Vec::new();
    if closed {
        if partial {
            let end_turn = DQuat::from_axis_angle(axis.direction, angle);
            faces.push(StubEntity::new(
                profile.centroid,
                -profile.plane_normal,
                profile.enclosed_area,
            ));
            faces.push(StubEntity::new(
                end_turn * (profile.centroid - axis.origin) + axis.origin,
                end_turn * profile.plane_normal,
                profile.enclosed_area,
            ));
        }
        let volume = profile.enclosed_area * radius_of(profile.centroid) * sweep;
        if volume < EPS {
            return Err(CadError::Degenerate(
                "profile touches the revolution axis everywhere".into(),
            ));
        }
        solids.push(StubEntity::new(place(profile.centroid), DVec3::ZERO, volume));
    }

    let face_count = faces.len() as u32;
    Ok(StubShape {
        wires: face_count,
        closed_wires: face_count,
        shells: 1,
        vertices: profile.vertices.clone(),
        edges,
        faces,
        solids,
        enclosed_area: 0.0,
        centroid: place(profile.centroid),
        plane_normal: DVec3::ZERO,
    })
}

fn sweep(profile: &StubShape, path: &StubShape) -> CadResult<StubShape> {
    if !profile.is_closed_profile() {
        return Err(CadError::InvalidProfile(
            "sweep profile must be closed".into(),
        ));
    }
    if path.wires != 1 || !path.solids.is_empty() || !path.faces.is_empty() {
        return Err(CadError::InvalidProfile("sweep path must be a single wire".into()));
    }

    let length: f64 = path.edges.iter().map(|e| e.size).sum();
    let start = path
        .vertices
        .first()
        .map(|v| v.centroid)
        .unwrap_or(path.centroid);
    let offset = path.centroid - start;

    let mut faces: Vec<StubEntity> = profile
        .edges
        .iter()
        .map(|e| StubEntity::new(e.centroid + offset, DVec3::ZERO, e.size * length))
        .collect();
    if path.closed_wires == 0 {
        let end = path
            .vertices
            .last()
            .map(|v| v.centroid)
            .unwrap_or(path.centroid);
        faces.push(StubEntity::new(
            profile.centroid,
            -profile.plane_normal,
            profile.enclosed_area,
        ));
        faces.push(StubEntity::new(
            profile.centroid + (end - start),
            profile.plane_normal,
            profile.enclosed_area,
        ));
    }

    let mut edges = profile.edges.clone();
    edges.extend(path.edges.iter().cloned());
    let face_count = faces.len() as u32;
    Ok(StubShape {
        wires: face_count,
        closed_wires: face_count,
        shells: 1,
        vertices: profile.vertices.clone(),
        edges,
        faces,
        solids: vec![StubEntity::new(
            profile.centroid + offset,
            DVec3::ZERO,
            profile.enclosed_area * length,
        )],
        enclosed_area: 0.0,
        centroid: profile.centroid + offset,
        plane_normal: DVec3::ZERO,
    })
}

fn loft(sections: &[StubShape], solid: bool) -> CadResult<StubShape> {
    if sections.len() < 2 {
        return Err(CadError::InvalidProfile(
            "loft requires at least 2 profiles".into(),
        ));
    }
    if sections.iter().any(|s| !s.is_closed_profile()) {
        return Err(CadError::InvalidProfile(
            "loft sections must be closed profiles".into(),
        ));
    }

    let mut faces = Vec::new();
    let mut volume = 0.0;
    for pair in sections.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let gap = (b.centroid - a.centroid).length();
        if gap < EPS {
            return Err(CadError::Degenerate("coincident loft sections".into()));
        }
        for e in &a.edges {
            faces.push(StubEntity::new(
                (e.centroid + b.centroid - a.centroid + e.centroid) * 0.5,
                DVec3::ZERO,
                e.size * gap,
            ));
        }
        volume += 0.5 * (a.enclosed_area + b.enclosed_area) * gap;
    }

    let first = &sections[0];
    let last = &sections[sections.len() - 1];
    let mut solids = Vec::new();
    if solid {
        faces.push(StubEntity::new(
            first.centroid,
            -first.plane_normal,
            first.enclosed_area,
        ));
        faces.push(StubEntity::new(
            last.centroid,
            last.plane_normal,
            last.enclosed_area,
        ));
        solids.push(StubEntity::new(
            (first.centroid + last.centroid) * 0.5,
            DVec3::ZERO,
            volume,
        ));
    }

    let face_count = faces.len() as u32;
    Ok(StubShape {
        wires: face_count,
        closed_wires: face_count,
        shells: 1,
        vertices: sections
            .iter()
            .flat_map(|s| s.vertices.iter().cloned())
            .collect(),
        edges: sections
            .iter()
            .flat_map(|s| s.edges.iter().cloned())
            .collect(),
        faces,
        solids,
        enclosed_area: 0.0,
        centroid: (first.centroid + last.centroid) * 0.5,
        plane_normal: DVec3::ZERO,
    })
}

fn overlap(a: (DVec3, DVec3), b: (DVec3, DVec3)) -> Option<(DVec3, DVec3)> {
    let lo = a.0.max(b.0);
    let hi = a.1.min(b.1);
    if (hi - lo).min_element() > EPS {
        Some((lo, hi))
    } else {
        None
    }
}

fn boolean(target: &StubShape, tool: &StubShape, op: BooleanType) -> CadResult<StubShape> {
    if target.solids.is_empty() || tool.solids.is_empty() {
        return Err(CadError::BooleanFailed("operands must be solids".into()));
    }

    let common = overlap(target.bounds(), tool.bounds());
    let common_volume = common.map(|(lo, hi)| {
        let d = hi - lo;
        d.x * d.y * d.z
    });

    match op {
        BooleanType::Intersect => {
            let (lo, hi) = common
                .ok_or_else(|| CadError::Degenerate("intersection is empty".into()))?;
            make_box(lo, hi - lo, false)
        }
        BooleanType::Union => {
            let mut result = target.clone();
            result.vertices.extend(tool.vertices.iter().cloned());
            result.edges.extend(tool.edges.iter().cloned());
            result.faces.extend(tool.faces.iter().cloned());
            result.wires += tool.wires;
            result.closed_wires += tool.closed_wires;
            match common_volume {
                Some(shared) => {
                    let volume = target.volume() + tool.volume() - shared;
                    result.solids = vec![StubEntity::new(
                        (target.centroid + tool.centroid) * 0.5,
                        DVec3::ZERO,
                        volume,
                    )];
                }
                None => {
                    result.solids.extend(tool.solids.iter().cloned());
                    result.shells += tool.shells;
                }
            }
            result.centroid = (target.centroid + tool.centroid) * 0.5;
            Ok(result)
        }
        BooleanType::Subtract => {
            let Some(shared) = common_volume else {
                return Ok(target.clone());
            };
            let volume = target.volume() - shared;
            if volume <= EPS {
                return Err(CadError::Degenerate("subtraction removes everything".into()));
            }
            let (lo, hi) = target.bounds();
            let inside = |p: DVec3| p.cmpge(lo - EPS).all() && p.cmple(hi + EPS).all();
            let mut result = target.clone();
            for face in tool.faces.iter().filter(|f| inside(f.centroid)) {
                result
                    .faces
                    .push(StubEntity::new(face.centroid, -face.normal, face.size));
                result.wires += 1;
                result.closed_wires += 1;
            }
            result.edges.extend(
                tool.edges
                    .iter()
                    .filter(|e| inside(e.centroid))
                    .cloned(),
            );
            result.solids = vec![StubEntity::new(target.centroid, DVec3::ZERO, volume)];
            Ok(result)
        }
    }
}

#[derive(Clone, Copy)]
enum EdgeTreatment {
    Fillet,
    Chamfer,
}

fn round_edges(
    body: &StubShape,
    edges: &[u32],
    size: f64,
    treatment: EdgeTreatment,
) -> CadResult<StubShape> {
    if body.solids.is_empty() {
        return Err(CadError::OperationFailed(
            "edge treatment needs a solid body".into(),
        ));
    }
    if edges.is_empty() {
        return Err(CadError::OperationFailed("no edges selected".into()));
    }
    if size <= EPS {
        return Err(CadError::Degenerate("size must be positive".into()));
    }

    let mut result = body.clone();
    let mut removed = 0.0;
    for &index in edges {
        let edge = body.edges.get(index as usize).ok_or(CadError::InvalidEntity {
            kind: EntityKind::Edge,
            index,
        })?;
        if size * 2.0 >= edge.size {
            return Err(CadError::OperationFailed(format!(
                "size {} too large for edge {} of length {}",
                size, index, edge.size
            )));
        }
        let normal = (edge.centroid - body.centroid).normalize_or_zero();
        let (area, cut) = match treatment {
            EdgeTreatment::Fillet => (
                edge.size * size * PI * 0.5,
                edge.size * size * size * (1.0 - PI / 4.0),
            ),
            EdgeTreatment::Chamfer => (
                edge.size * size * std::f64::consts::SQRT_2,
                edge.size * size * size * 0.5,
            ),
        };
        result
            .faces
            .push(StubEntity::new(edge.centroid, normal, area));
        result
            .edges
            .push(StubEntity::new(edge.centroid, DVec3::ZERO, edge.size));
        result.wires += 1;
        result.closed_wires += 1;
        removed += cut;
    }
    for solid in &mut result.solids {
        solid.size -= removed / body.solids.len() as f64;
    }
    Ok(result)
}

fn shell(body: &StubShape, faces_to_remove: &[u32], thickness: f64) -> CadResult<StubShape> {
    if body.solids.is_empty() {
        return Err(CadError::OperationFailed("shell needs a solid body".into()));
    }
    if thickness.abs() < EPS {
        return Err(CadError::Degenerate("shell thickness is zero".into()));
    }
    for &index in faces_to_remove {
        if index as usize >= body.faces.len() {
            return Err(CadError::InvalidEntity {
                kind: EntityKind::Face,
                index,
            });
        }
    }

    let kept: Vec<&StubEntity> = body
        .faces
        .iter()
        .enumerate()
        .filter(|(i, _)| !faces_to_remove.contains(&(*i as u32)))
        .map(|(_, f)| f)
        .collect();

    let mut faces: Vec<StubEntity> = kept.iter().map(|f| (*f).clone()).collect();
    faces.extend(
        kept.iter()
            .map(|f| StubEntity::new(f.centroid - f.normal * thickness, -f.normal, f.size)),
    );
    let wall: f64 = kept.iter().map(|f| f.size).sum::<f64>() * thickness.abs();
    if wall >= body.volume() {
        return Err(CadError::OperationFailed(
            "shell thickness consumes the whole body".into(),
        ));
    }

    let mut result = body.clone();
    result.wires = faces.len() as u32;
    result.closed_wires = faces.len() as u32;
    result.faces = faces;
    result.solids = vec![StubEntity::new(body.centroid, DVec3::ZERO, wall)];
    Ok(result)
}

fn compound(parts: &[StubShape]) -> CadResult<StubShape> {
    if parts.is_empty() {
        return Err(CadError::OperationFailed("compound needs at least one part".into()));
    }
    let mut result = StubShape::default();
    for part in parts {
        result.wires += part.wires;
        result.closed_wires += part.closed_wires;
        result.shells += part.shells;
        result.vertices.extend(part.vertices.iter().cloned());
        result.edges.extend(part.edges.iter().cloned());
        result.faces.extend(part.faces.iter().cloned());
        result.solids.extend(part.solids.iter().cloned());
    }
    result.centroid = centroid_of(parts.iter().map(|p| p.centroid));
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_box(kernel: &StubKernel) -> Shape {
        kernel
            .build(&KernelOp::Box {
                origin: DVec3::ZERO,
                extent: DVec3::new(2.0, 3.0, 4.0),
                centered: false,
            })
            .unwrap()
    }

    #[test]
    fn test_box_topology() {
        let kernel = StubKernel::new();
        let shape = unit_box(&kernel);
        let summary = kernel.summarize(&shape).unwrap();
        assert_eq!(summary.vertices, 8);
        assert_eq!(summary.edges, 12);
        assert_eq!(summary.faces, 6);
        assert!(summary.is_single_volume());

        let volume = kernel
            .measure(&shape, QuantityKind::Volume, EntityKind::Solid, 0)
            .unwrap();
        assert_relative_eq!(volume, 24.0);

        let top = kernel
            .measure(&shape, QuantityKind::CentroidZ, EntityKind::Face, 5)
            .unwrap();
        assert_relative_eq!(top, 4.0);
    }

    #[test]
    fn test_identical_requests_share_ids() {
        let kernel = StubKernel::new();
        let a = unit_box(&kernel);
        let b = unit_box(&kernel);
        assert_eq!(a, b);
        assert_eq!(kernel.build_calls(), 2);
        assert_eq!(kernel.shape_count(), 1);
    }

    #[test]
    fn test_undefined_quantity() {
        let kernel = StubKernel::new();
        let shape = unit_box(&kernel);
        assert!(matches!(
            kernel.measure(&shape, QuantityKind::Area, EntityKind::Edge, 0),
            Err(CadError::UndefinedQuantity { .. })
        ));
        assert!(matches!(
            kernel.measure(&shape, QuantityKind::Length, EntityKind::Edge, 40),
            Err(CadError::InvalidEntity { index: 40, .. })
        ));
    }

    #[test]
    fn test_extrude_closed_polyline() {
        let kernel = StubKernel::new();
        let square = kernel
            .build(&KernelOp::Polyline {
                points: vec![
                    DVec3::ZERO,
                    DVec3::X,
                    DVec3::new(1.0, 1.0, 0.0),
                    DVec3::Y,
                ],
                closed: true,
            })
            .unwrap();
        assert!(kernel.summarize(&square).unwrap().is_single_closed_wire());

        let prism = kernel
            .build(&KernelOp::Extrude {
                profile: &square,
                direction: DVec3::Z * 2.0,
                symmetric: false,
            })
            .unwrap();
        let summary = kernel.summarize(&prism).unwrap();
        assert_eq!(summary.faces, 6);
        let volume = kernel
            .measure(&prism, QuantityKind::Volume, EntityKind::Solid, 0)
            .unwrap();
        assert_relative_eq!(volume, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_failure_injection() {
        let kernel = StubKernel::new().with_failure("Sphere");
        let result = kernel.build(&KernelOp::Sphere {
            center: DVec3::ZERO,
            radius: 1.0,
        });
        assert!(matches!(result, Err(CadError::OperationFailed(_))));
        assert_eq!(kernel.build_calls_for("Sphere"), 1);
    }

    #[test]
    fn test_fillet_rejects_missing_edge() {
        let kernel = StubKernel::new();
        let shape = unit_box(&kernel);
        let result = kernel.build(&KernelOp::Fillet {
            body: &shape,
            edges: &[3, 99],
            radius: 0.1,
        });
        assert_eq!(
            result,
            Err(CadError::InvalidEntity {
                kind: EntityKind::Edge,
                index: 99
            })
        );
    }

    #[test]
    fn test_export_import() {
        let kernel = StubKernel::new();
        let shape = unit_box(&kernel);
        let bytes = kernel.export_shape(&shape).unwrap();

        let other = StubKernel::new();
        let restored = other.import_shape(&bytes).unwrap();
        assert_eq!(
            other.summarize(&restored).unwrap(),
            kernel.summarize(&shape).unwrap()
        );
    }
}
