//! 碰撞体
//!
//! 设计要点：
//! - 纯位置投影，无反弹（零恢复系数）
//! - 固定粒子与被排除的粒子永远不会被碰撞移动
//! - 碰撞体可挂在骨骼上（形状在骨骼空间中定义），每帧换算到世界空间
//! - CollisionSet 由配置层持有，运行时以 Arc 只读共享

use std::collections::HashSet;

use glam::{Mat4, Quat, Vec3};

use super::constraint::DEGENERATE_LENGTH;
use super::particle::Particle;
use crate::skeleton::BoneSet;
use crate::{Result, VerletError};

// ============================================================================
// 平面
// ============================================================================

/// 平面（法线已归一化）
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plane {
    pub point: Vec3,
    pub normal: Vec3,
}

impl Plane {
    /// 法线为零时返回的平面法线也为零，需要先校验
    pub fn new(point: Vec3, normal: Vec3) -> Self {
        Self {
            point,
            normal: normal.normalize_or_zero(),
        }
    }

    /// 到平面的有符号距离（法线一侧为正）
    #[inline]
    pub fn signed_distance(&self, position: Vec3) -> f32 {
        (position - self.point).dot(self.normal)
    }
}

// ============================================================================
// 碰撞形状
// ============================================================================

/// 碰撞形状
#[derive(Clone, Debug, PartialEq)]
pub enum CollisionShape {
    Sphere { center: Vec3, radius: f32 },
    Capsule { start: Vec3, end: Vec3, radius: f32 },
    Plane(Plane),
    Box { center: Vec3, rotation: Quat, half_extents: Vec3 },
}

impl CollisionShape {
    pub fn sphere(center: Vec3, radius: f32) -> Self {
        CollisionShape::Sphere { center, radius }
    }

    pub fn capsule(start: Vec3, end: Vec3, radius: f32) -> Self {
        CollisionShape::Capsule { start, end, radius }
    }

    pub fn plane(point: Vec3, normal: Vec3) -> Self {
        CollisionShape::Plane(Plane::new(point, normal))
    }

    pub fn cuboid(center: Vec3, rotation: Quat, half_extents: Vec3) -> Self {
        CollisionShape::Box {
            center,
            rotation,
            half_extents,
        }
    }

    /// 变换到另一空间（半径不随缩放变化）
    pub fn transformed(&self, transform: &Mat4) -> Self {
        match self {
            CollisionShape::Sphere { center, radius } => CollisionShape::Sphere {
                center: transform.transform_point3(*center),
                radius: *radius,
            },
            CollisionShape::Capsule { start, end, radius } => CollisionShape::Capsule {
                start: transform.transform_point3(*start),
                end: transform.transform_point3(*end),
                radius: *radius,
            },
            CollisionShape::Plane(plane) => CollisionShape::Plane(Plane::new(
                transform.transform_point3(plane.point),
                transform.transform_vector3(plane.normal),
            )),
            CollisionShape::Box {
                center,
                rotation,
                half_extents,
            } => {
                let (_, bone_rotation, _) = transform.to_scale_rotation_translation();
                CollisionShape::Box {
                    center: transform.transform_point3(*center),
                    rotation: (bone_rotation * *rotation).normalize(),
                    half_extents: *half_extents,
                }
            }
        }
    }

    /// 把粒子推出碰撞体，返回是否发生了修正
    pub fn resolve(&self, particle: &mut Particle) -> bool {
        if particle.is_fixed() {
            return false;
        }

        match self {
            CollisionShape::Sphere { center, radius } => {
                push_out_of_sphere(particle, *center, *radius + particle.radius)
            }
            CollisionShape::Capsule { start, end, radius } => {
                let closest = closest_point_on_segment(particle.position, *start, *end);
                push_out_of_sphere(particle, closest, *radius + particle.radius)
            }
            CollisionShape::Plane(plane) => {
                let dist = plane.signed_distance(particle.position);
                if dist >= particle.radius {
                    return false;
                }
                particle.position += plane.normal * (particle.radius - dist);
                true
            }
            CollisionShape::Box {
                center,
                rotation,
                half_extents,
            } => {
                let local = rotation.inverse() * (particle.position - *center);
                let half = *half_extents + Vec3::splat(particle.radius);
                let depth = half - local.abs();
                if depth.min_element() <= 0.0 {
                    return false;
                }

                // 沿穿透最浅的轴推出
                let mut offset = Vec3::ZERO;
                let axis = if depth.x <= depth.y && depth.x <= depth.z {
                    0
                } else if depth.y <= depth.z {
                    1
                } else {
                    2
                };
                let sign = if local[axis] < 0.0 { -1.0 } else { 1.0 };
                offset[axis] = sign * half[axis] - local[axis];

                particle.position += *rotation * offset;
                true
            }
        }
    }

    /// 形状自身的半径（平面与盒子为 0）
    pub fn radius(&self) -> f32 {
        match self {
            CollisionShape::Sphere { radius, .. } | CollisionShape::Capsule { radius, .. } => *radius,
            CollisionShape::Plane(_) | CollisionShape::Box { .. } => 0.0,
        }
    }
}

fn push_out_of_sphere(particle: &mut Particle, center: Vec3, min_distance: f32) -> bool {
    let offset = particle.position - center;
    let distance_sq = offset.length_squared();
    if distance_sq >= min_distance * min_distance {
        return false;
    }

    let distance = distance_sq.sqrt();
    let normal = if distance > DEGENERATE_LENGTH {
        offset / distance
    } else {
        // 正好在中心：沿来时的方向推出
        let back = particle.previous_position - center;
        if back.length_squared() < DEGENERATE_LENGTH * DEGENERATE_LENGTH {
            return false;
        }
        back.normalize()
    };

    particle.position = center + normal * min_distance;
    true
}

fn closest_point_on_segment(point: Vec3, start: Vec3, end: Vec3) -> Vec3 {
    let segment = end - start;
    let length_sq = segment.length_squared();
    if length_sq < DEGENERATE_LENGTH * DEGENERATE_LENGTH {
        return start;
    }
    let t = ((point - start).dot(segment) / length_sq).clamp(0.0, 1.0);
    start + segment * t
}

// ============================================================================
// 碰撞体
// ============================================================================

/// 碰撞体
#[derive(Clone, Debug)]
pub struct CollisionPrimitive {
    pub name: String,
    pub shape: CollisionShape,
    /// 挂载骨骼（shape 在该骨骼空间中定义），None 表示世界空间
    pub attached_bone: Option<String>,
    /// 不与此碰撞体发生碰撞的骨骼
    pub excluded_bones: Vec<String>,
    pub enabled: bool,
}

impl CollisionPrimitive {
    pub fn new(name: impl Into<String>, shape: CollisionShape) -> Self {
        Self {
            name: name.into(),
            shape,
            attached_bone: None,
            excluded_bones: Vec::new(),
            enabled: true,
        }
    }

    pub fn attached_to(mut self, bone: impl Into<String>) -> Self {
        self.attached_bone = Some(bone.into());
        self
    }

    pub fn excluding<S: Into<String>>(mut self, bones: impl IntoIterator<Item = S>) -> Self {
        self.excluded_bones.extend(bones.into_iter().map(Into::into));
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let radius = self.shape.radius();
        if !(radius >= 0.0) {
            return Err(VerletError::NegativeRadius {
                owner: self.name.clone(),
                radius,
            });
        }
        match &self.shape {
            CollisionShape::Plane(plane) if plane.normal == Vec3::ZERO => Err(VerletError::InvalidSetting {
                name: "collision plane",
                reason: format!("collider '{}' has a zero normal", self.name),
            }),
            CollisionShape::Box { half_extents, .. } if half_extents.min_element() < 0.0 => {
                Err(VerletError::InvalidSetting {
                    name: "collision box",
                    reason: format!("collider '{}' has negative half extents", self.name),
                })
            }
            _ => Ok(()),
        }
    }
}

// ============================================================================
// 碰撞体集合
// ============================================================================

/// 碰撞体集合（构建后只读）
#[derive(Clone, Debug, Default)]
pub struct CollisionSet {
    primitives: Vec<CollisionPrimitive>,
}

impl CollisionSet {
    pub fn new(primitives: Vec<CollisionPrimitive>) -> Result<Self> {
        let mut names = HashSet::with_capacity(primitives.len());
        for primitive in &primitives {
            primitive.validate()?;
            if !names.insert(primitive.name.as_str()) {
                return Err(VerletError::InvalidSetting {
                    name: "colliders",
                    reason: format!("duplicate collider name '{}'", primitive.name),
                });
            }
        }
        Ok(Self { primitives })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    #[inline]
    pub fn primitives(&self) -> &[CollisionPrimitive] {
        &self.primitives
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<&CollisionPrimitive> {
        self.primitives.get(idx)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.primitives.iter().position(|p| p.name == name)
    }

    /// 解析每个碰撞体的挂载骨骼索引
    pub fn attached_bone_indices(&self, bones: &BoneSet) -> Result<Vec<Option<usize>>> {
        self.primitives
            .iter()
            .map(|p| p.attached_bone.as_deref().map(|name| bones.bone_index(name)).transpose())
            .collect()
    }

    /// 换算到世界空间，禁用的碰撞体输出 None
    ///
    /// `attached` 来自 attached_bone_indices，`out` 复用缓冲区。
    pub fn resolve_world(
        &self,
        attached: &[Option<usize>],
        pose: &[Mat4],
        out: &mut Vec<Option<CollisionShape>>,
    ) {
        out.clear();
        out.extend(self.primitives.iter().zip(attached).map(|(primitive, bone)| {
            if !primitive.enabled {
                return None;
            }
            match bone.and_then(|b| pose.get(b)) {
                Some(transform) => Some(primitive.shape.transformed(transform)),
                None => Some(primitive.shape.clone()),
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::BoneLink;

    fn free_particle(position: Vec3) -> Particle {
        Particle::new(position, 1.0)
    }

    #[test]
    fn test_sphere_projection() {
        let sphere = CollisionShape::sphere(Vec3::ZERO, 1.0);
        let mut p = free_particle(Vec3::new(0.5, 0.0, 0.0)).with_radius(0.1);
        assert!(sphere.resolve(&mut p));
        assert!((p.position.length() - 1.1).abs() < 1e-5);
        assert!(p.position.x > 0.0);

        // 已在外部：不动
        let mut outside = free_particle(Vec3::new(2.0, 0.0, 0.0));
        assert!(!sphere.resolve(&mut outside));
        assert_eq!(outside.position, Vec3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn test_sphere_center_uses_previous_position() {
        let sphere = CollisionShape::sphere(Vec3::ZERO, 1.0);
        let mut p = free_particle(Vec3::ZERO);
        p.previous_position = Vec3::new(0.0, 3.0, 0.0);
        assert!(sphere.resolve(&mut p));
        assert!((p.position - Vec3::new(0.0, 1.0, 0.0)).length() < 1e-5);

        // 没有任何方向信息：跳过
        let mut stuck = free_particle(Vec3::ZERO);
        assert!(!sphere.resolve(&mut stuck));
        assert!(stuck.position.is_finite());
    }

    #[test]
    fn test_fixed_particle_is_never_moved() {
        let sphere = CollisionShape::sphere(Vec3::ZERO, 1.0);
        let mut root = Particle::fixed(Vec3::new(0.2, 0.0, 0.0));
        assert!(!sphere.resolve(&mut root));
        assert_eq!(root.position, Vec3::new(0.2, 0.0, 0.0));
    }

    #[test]
    fn test_capsule_projection() {
        let capsule = CollisionShape::capsule(Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0), 0.5);
        let mut p = free_particle(Vec3::new(0.3, 0.2, 0.0));
        assert!(capsule.resolve(&mut p));
        assert!((p.position - Vec3::new(0.3, 0.5, 0.0)).length() < 1e-5);

        // 端点半球
        let mut cap = free_particle(Vec3::new(1.2, 0.0, 0.0));
        assert!(capsule.resolve(&mut cap));
        assert!((cap.position - Vec3::new(1.5, 0.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_plane_projection() {
        let floor = CollisionShape::plane(Vec3::ZERO, Vec3::new(0.0, 2.0, 0.0));
        let mut p = free_particle(Vec3::new(1.0, -0.5, 0.0)).with_radius(0.05);
        assert!(floor.resolve(&mut p));
        assert!((p.position - Vec3::new(1.0, 0.05, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_box_projection() {
        let cuboid = CollisionShape::cuboid(Vec3::ZERO, Quat::IDENTITY, Vec3::new(1.0, 0.5, 1.0));
        let mut p = free_particle(Vec3::new(0.2, 0.4, -0.1));
        assert!(cuboid.resolve(&mut p));
        assert!((p.position - Vec3::new(0.2, 0.5, -0.1)).length() < 1e-5);

        // 旋转后的盒子：局部 +Y 指向世界 +X
        let rotated = CollisionShape::cuboid(
            Vec3::ZERO,
            Quat::from_rotation_z(-std::f32::consts::FRAC_PI_2),
            Vec3::new(1.0, 0.5, 1.0),
        );
        let mut q = free_particle(Vec3::new(0.4, 0.2, 0.0));
        assert!(rotated.resolve(&mut q));
        assert!((q.position.x - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_transformed_by_bone() {
        let sphere = CollisionShape::sphere(Vec3::new(0.0, 1.0, 0.0), 0.2);
        let bone = Mat4::from_rotation_translation(
            Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
            Vec3::new(5.0, 0.0, 0.0),
        );
        match sphere.transformed(&bone) {
            CollisionShape::Sphere { center, radius } => {
                assert!((center - Vec3::new(4.0, 0.0, 0.0)).length() < 1e-5);
                assert!((radius - 0.2).abs() < 1e-6);
            }
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn test_collision_set() {
        let negative = CollisionSet::new(vec![CollisionPrimitive::new(
            "head",
            CollisionShape::sphere(Vec3::ZERO, -0.1),
        )]);
        assert!(matches!(negative, Err(VerletError::NegativeRadius { .. })));

        let duplicate = CollisionSet::new(vec![
            CollisionPrimitive::new("head", CollisionShape::sphere(Vec3::ZERO, 0.1)),
            CollisionPrimitive::new("head", CollisionShape::sphere(Vec3::ZERO, 0.2)),
        ]);
        assert!(duplicate.is_err());

        let bones = BoneSet::new(vec![
            BoneLink::new("root"),
            BoneLink::new("head").with_parent(0).with_offset(Vec3::new(0.0, 1.5, 0.0)),
        ])
        .unwrap();
        let set = CollisionSet::new(vec![
            CollisionPrimitive::new("head", CollisionShape::sphere(Vec3::ZERO, 0.1)).attached_to("head"),
            CollisionPrimitive::new("floor", CollisionShape::plane(Vec3::ZERO, Vec3::Y)).with_enabled(false),
        ])
        .unwrap();
        assert_eq!(set.find("floor"), Some(1));

        let attached = set.attached_bone_indices(&bones).unwrap();
        assert_eq!(attached, vec![Some(1), None]);

        let mut world = Vec::new();
        set.resolve_world(&attached, &bones.reference_pose(), &mut world);
        assert!(matches!(
            world[0],
            Some(CollisionShape::Sphere { center, .. }) if (center - Vec3::new(0.0, 1.5, 0.0)).length() < 1e-5
        ));
        assert!(world[1].is_none());

        let missing = CollisionSet::new(vec![
            CollisionPrimitive::new("tail", CollisionShape::sphere(Vec3::ZERO, 0.1)).attached_to("tail"),
        ])
        .unwrap();
        assert!(matches!(
            missing.attached_bone_indices(&bones),
            Err(VerletError::BoneNotFound(_))
        ));
    }
}
