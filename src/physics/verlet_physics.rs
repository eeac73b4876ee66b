//! Verlet 二次运动驱动器
//!
//! 每个角色实例一个 VerletPhysics，持有全部骨骼链。
//! 流程：new → 每帧 tick [读取姿态 → 积分 → 约束迭代 → 写回]
//!
//! 设计要点：
//! - 骨骼层次与碰撞体集合以 Arc 只读共享
//! - 链按骨骼层次分批：同一批内用 rayon 并行模拟，写回按顺序进行；
//!   根骨骼挂在其他链骨骼之下的链放在后面的批次，读取上游写回后的姿态
//! - 每帧用到的缓冲区预分配后复用
//! - 构建失败时可退化为禁用状态，直接输出动画姿态

use std::collections::HashSet;
use std::sync::Arc;

use glam::{Mat4, Vec3};
use rayon::prelude::*;

use super::chain::{Chain, ResetKind};
use super::collision::{CollisionSet, CollisionShape};
use super::config::ChainSettings;
use super::integrator::{Forces, WindField, DEFAULT_GRAVITY};
use super::pose_adapter::PoseAdapter;
use crate::skeleton::BoneSet;
use crate::{Result, VerletError};

/// 单帧输入
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickInput {
    /// 帧间隔（秒），<= 0 时跳过本帧
    pub delta_time: f32,
    pub reset: Option<ResetKind>,
    pub gravity: Vec3,
    pub wind: WindField,
}

impl Default for TickInput {
    fn default() -> Self {
        Self {
            delta_time: 0.0,
            reset: None,
            gravity: DEFAULT_GRAVITY,
            wind: WindField::Calm,
        }
    }
}

impl TickInput {
    pub fn new(delta_time: f32) -> Self {
        Self {
            delta_time,
            ..Default::default()
        }
    }

    pub fn with_reset(mut self, reset: ResetKind) -> Self {
        self.reset = Some(reset);
        self
    }

    pub fn with_gravity(mut self, gravity: Vec3) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn with_wind(mut self, wind: WindField) -> Self {
        self.wind = wind;
        self
    }
}

/// Verlet 二次运动驱动器
pub struct VerletPhysics {
    bones: Arc<BoneSet>,
    colliders: Arc<CollisionSet>,
    /// 按批次排列
    chains: Vec<Chain>,
    /// 每一批在 chains 中的结束位置
    stage_ends: Vec<usize>,
    enabled: bool,
    /// 累计模拟时间（风场采样）
    elapsed: f32,

    // --- 构建时计算 ---

    /// 碰撞体挂载的骨骼索引
    collider_bones: Vec<Option<usize>>,
    /// 被链驱动的骨骼索引集合
    simulated_bones: HashSet<usize>,

    // --- 预分配缓冲区（避免每帧堆分配） ---

    world_shapes: Vec<Option<CollisionShape>>,
    original_pose: Vec<Mat4>,
    changed: Vec<bool>,
    local_override_buf: Vec<(usize, Mat4)>,
}

impl VerletPhysics {
    /// 以参考姿态构建
    pub fn new(bones: Arc<BoneSet>, settings: &[ChainSettings], colliders: Arc<CollisionSet>) -> Result<Self> {
        let pose = bones.reference_pose();
        Self::with_pose(bones, settings, colliders, &pose)
    }

    /// 以指定姿态构建（决定链的静止长度）
    pub fn with_pose(
        bones: Arc<BoneSet>,
        settings: &[ChainSettings],
        colliders: Arc<CollisionSet>,
        pose: &[Mat4],
    ) -> Result<Self> {
        let collider_bones = colliders.attached_bone_indices(&bones)?;

        let mut chains = Vec::with_capacity(settings.len());
        let mut simulated_bones = HashSet::new();
        for chain_settings in settings {
            let chain = Chain::build(chain_settings, &bones, pose, &colliders)?;
            for bone in chain.bone_indices() {
                if !simulated_bones.insert(bone) {
                    return Err(VerletError::InvalidSetting {
                        name: "chains",
                        reason: format!(
                            "bone '{}' is simulated by more than one chain",
                            bones.bones()[bone].name
                        ),
                    });
                }
            }
            chains.push(chain);
        }
        let (chains, stage_ends) = order_by_hierarchy(&bones, chains);

        let particle_count: usize = chains.iter().map(|c| c.particles().len()).sum();
        let constraint_count: usize = chains.iter().map(|c| c.constraints().len()).sum();
        log::info!(
            "[AnimVerlet] 构建完成: {} 链 ({} 批), {} 粒子, {} 约束, {} 碰撞体",
            chains.len(),
            stage_ends.len(),
            particle_count,
            constraint_count,
            colliders.len()
        );

        let bone_count = bones.len();
        Ok(Self {
            bones,
            colliders,
            chains,
            stage_ends,
            enabled: true,
            elapsed: 0.0,
            collider_bones,
            simulated_bones,
            world_shapes: Vec::new(),
            original_pose: Vec::with_capacity(bone_count),
            changed: Vec::with_capacity(bone_count),
            local_override_buf: Vec::new(),
        })
    }

    /// 构建失败时记录日志并返回禁用的驱动器（输出动画姿态）
    pub fn new_or_disabled(
        bones: Arc<BoneSet>,
        settings: &[ChainSettings],
        colliders: Arc<CollisionSet>,
    ) -> Self {
        match Self::new(bones.clone(), settings, colliders.clone()) {
            Ok(physics) => physics,
            Err(err) => {
                log::warn!("[AnimVerlet] 构建失败，回退到动画姿态: {err}");
                Self::disabled(bones, colliders)
            }
        }
    }

    /// 不含任何链的禁用驱动器
    pub fn disabled(bones: Arc<BoneSet>, colliders: Arc<CollisionSet>) -> Self {
        Self {
            bones,
            colliders,
            chains: Vec::new(),
            stage_ends: Vec::new(),
            enabled: false,
            elapsed: 0.0,
            collider_bones: Vec::new(),
            simulated_bones: HashSet::new(),
            world_shapes: Vec::new(),
            original_pose: Vec::new(),
            changed: Vec::new(),
            local_override_buf: Vec::new(),
        }
    }

    // ========================================
    // 状态
    // ========================================

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 重新启用时，下一帧从动画姿态开始
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.reset();
        }
        self.enabled = enabled;
    }

    /// 下一帧所有链吸附到动画姿态
    pub fn reset(&mut self) {
        for chain in &mut self.chains {
            chain.mark_uninitialized();
        }
        self.elapsed = 0.0;
        log::debug!("[AnimVerlet] 重置 {} 条链", self.chains.len());
    }

    #[inline]
    pub fn bones(&self) -> &BoneSet {
        &self.bones
    }

    #[inline]
    pub fn colliders(&self) -> &CollisionSet {
        &self.colliders
    }

    /// 按骨骼层次排列（上游链在前）
    #[inline]
    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    #[inline]
    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|c| c.name() == name)
    }

    pub fn chain_mut(&mut self, name: &str) -> Option<&mut Chain> {
        self.chains.iter_mut().find(|c| c.name() == name)
    }

    #[inline]
    pub fn simulated_bones(&self) -> &HashSet<usize> {
        &self.simulated_bones
    }

    /// 上一帧被链驱动的骨骼的本地变换
    #[inline]
    pub fn local_overrides(&self) -> &[(usize, Mat4)] {
        &self.local_override_buf
    }

    // ========================================
    // 每帧
    // ========================================

    /// 模拟一帧并把结果写回 `pose`（世界空间，每根骨骼一个矩阵）
    ///
    /// 禁用、没有链或 dt <= 0 时 `pose` 保持不变；dt <= 0 时收到的重置在下一帧执行。
    pub fn tick(&mut self, input: &TickInput, pose: &mut [Mat4]) -> Result<()> {
        if !self.enabled || self.chains.is_empty() {
            return Ok(());
        }
        if !(input.delta_time > 0.0) {
            if let Some(reset) = input.reset {
                for chain in &mut self.chains {
                    chain.request_reset(reset);
                }
            }
            return Ok(());
        }
        self.bones.check_pose_len(pose.len())?;

        self.elapsed += input.delta_time;
        self.colliders
            .resolve_world(&self.collider_bones, pose, &mut self.world_shapes);

        let forces = Forces {
            gravity: input.gravity,
            wind: input.wind,
            time: self.elapsed,
        };
        let reset = input.reset;
        let delta_time = input.delta_time;
        let mut start = 0;
        for &end in &self.stage_ends {
            // 本批读取的姿态，已包含之前批次的结果
            self.original_pose.clear();
            self.original_pose.extend_from_slice(pose);

            let current = &self.original_pose;
            let world_shapes = &self.world_shapes;
            self.chains[start..end].par_iter_mut().for_each(|chain| {
                PoseAdapter::read(chain, current);
                chain.simulate(delta_time, &forces, reset, world_shapes);
            });

            self.changed.clear();
            self.changed.resize(pose.len(), false);
            for chain in &mut self.chains[start..end] {
                PoseAdapter::write(chain, pose, &mut self.changed);
            }
            self.bones
                .propagate_to_descendants(&self.original_pose, pose, &mut self.changed);
            start = end;
        }

        self.local_override_buf.clear();
        for chain in &self.chains {
            PoseAdapter::local_overrides(chain, &self.bones, pose, &mut self.local_override_buf);
        }

        log::trace!(
            "[AnimVerlet] tick dt={:.4} chains={} bones={}",
            delta_time,
            self.chains.len(),
            self.local_override_buf.len()
        );
        Ok(())
    }
}

/// 按骨骼层次给链分批并排序，返回排序后的链与每批的结束位置
///
/// 链 A 的某根骨骼是链 B 根骨骼的祖先时，B 排在 A 之后的批次。
/// 链内骨骼都是链根的后代，这种依赖不会成环。
fn order_by_hierarchy(bones: &BoneSet, chains: Vec<Chain>) -> (Vec<Chain>, Vec<usize>) {
    let roots: Vec<Option<usize>> = chains.iter().map(|c| c.bone_indices().next()).collect();
    let mut stages = vec![0usize; chains.len()];
    for _ in 0..chains.len() {
        let mut moved = false;
        for (i, root) in roots.iter().enumerate() {
            let Some(root) = *root else {
                continue;
            };
            for (j, upstream) in chains.iter().enumerate() {
                if i != j
                    && stages[i] <= stages[j]
                    && upstream.bone_indices().any(|bone| bones.is_ancestor(bone, root))
                {
                    stages[i] = stages[j] + 1;
                    moved = true;
                }
            }
        }
        if !moved {
            break;
        }
    }

    let mut staged: Vec<(usize, Chain)> = stages.into_iter().zip(chains).collect();
    staged.sort_by_key(|(stage, _)| *stage);

    let mut stage_ends = Vec::new();
    for (i, pair) in staged.windows(2).enumerate() {
        if pair[0].0 != pair[1].0 {
            stage_ends.push(i + 1);
        }
    }
    if !staged.is_empty() {
        stage_ends.push(staged.len());
    }
    if stage_ends.len() > 1 {
        log::debug!("[AnimVerlet] 链按骨骼层次分为 {} 批", stage_ends.len());
    }
    (staged.into_iter().map(|(_, chain)| chain).collect(), stage_ends)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::collision::CollisionPrimitive;
    use crate::skeleton::{BoneLink, BoneTransform};

    /// hips → tail_0 → tail_1 → tail_2 → tuft，尾巴沿 -Z 水平伸出；spine 不参与模拟
    fn tail_bones() -> Arc<BoneSet> {
        Arc::new(
            BoneSet::new(vec![
                BoneLink::new("hips").with_offset(Vec3::new(0.0, 1.0, 0.0)),
                BoneLink::new("tail_0").with_parent(0).with_offset(Vec3::new(0.0, 0.0, -0.2)),
                BoneLink::new("tail_1").with_parent(1).with_offset(Vec3::new(0.0, 0.0, -0.3)),
                BoneLink::new("tail_2").with_parent(2).with_offset(Vec3::new(0.0, 0.0, -0.3)),
                BoneLink::new("tuft").with_parent(3).with_offset(Vec3::new(0.0, 0.05, -0.1)),
                BoneLink::new("spine").with_parent(0).with_offset(Vec3::new(0.0, 0.5, 0.0)),
            ])
            .unwrap(),
        )
    }

    fn tail_settings() -> ChainSettings {
        ChainSettings::new("tail", ["tail_0", "tail_1", "tail_2"])
    }

    fn tail_physics(colliders: CollisionSet) -> VerletPhysics {
        VerletPhysics::new(tail_bones(), &[tail_settings()], Arc::new(colliders)).unwrap()
    }

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn position(m: &Mat4) -> Vec3 {
        m.col(3).truncate()
    }

    #[test]
    fn test_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VerletPhysics>();
    }

    #[test]
    fn test_tail_droops_under_gravity() {
        init_logger();
        let mut physics = tail_physics(CollisionSet::empty());
        let bones = tail_bones();
        let animated = bones.reference_pose();

        let mut pose = animated.clone();
        for _ in 0..120 {
            pose.copy_from_slice(&animated);
            physics.tick(&TickInput::new(1.0 / 60.0), &mut pose).unwrap();
        }

        // 根骨骼位置不变，尾端下垂
        assert!((position(&pose[1]) - position(&animated[1])).length() < 1e-5);
        assert!(position(&pose[3]).y < 0.9);

        // 骨骼长度保持
        assert!((position(&pose[2]).distance(position(&pose[1])) - 0.3).abs() < 1e-4);
        assert!((position(&pose[3]).distance(position(&pose[2])) - 0.3).abs() < 1e-4);

        // 未模拟的骨骼：hips / spine 原样，tuft 保持相对 tail_2 的本地变换
        assert_eq!(pose[0], animated[0]);
        assert_eq!(pose[5], animated[5]);
        let tuft_local = BoneTransform::from_matrix(pose[3].inverse() * pose[4]);
        assert!((tuft_local.translation - Vec3::new(0.0, 0.05, -0.1)).length() < 1e-4);

        assert_eq!(physics.local_overrides().len(), 3);
        assert_eq!(physics.simulated_bones().len(), 3);
    }

    #[test]
    fn test_floor_collider() {
        let floor = CollisionPrimitive::new("floor", CollisionShape::plane(Vec3::new(0.0, 0.8, 0.0), Vec3::Y));
        let mut physics = tail_physics(CollisionSet::new(vec![floor]).unwrap());
        let animated = tail_bones().reference_pose();

        let mut pose = animated.clone();
        for _ in 0..120 {
            pose.copy_from_slice(&animated);
            physics.tick(&TickInput::new(1.0 / 60.0), &mut pose).unwrap();
        }

        let chain = physics.chain("tail").unwrap();
        let radius = chain.settings().particle_radius;
        for particle in chain.particles() {
            assert!(particle.position.y >= 0.8 + radius - 1e-4, "y = {}", particle.position.y);
        }
    }

    #[test]
    fn test_skip_conditions_leave_pose_untouched() {
        let mut physics = tail_physics(CollisionSet::empty());
        let animated = tail_bones().reference_pose();
        let mut pose: Vec<Mat4> = animated
            .iter()
            .map(|m| *m * Mat4::from_translation(Vec3::new(0.0, 0.0, 0.1)))
            .collect();
        let before = pose.clone();

        physics.tick(&TickInput::new(0.0), &mut pose).unwrap();
        physics.tick(&TickInput::new(-1.0), &mut pose).unwrap();
        assert_eq!(pose, before);

        physics.set_enabled(false);
        physics.tick(&TickInput::new(1.0 / 60.0), &mut pose).unwrap();
        assert_eq!(pose, before);

        let mut short = vec![Mat4::IDENTITY; 2];
        physics.set_enabled(true);
        assert!(matches!(
            physics.tick(&TickInput::new(1.0 / 60.0), &mut short),
            Err(VerletError::PoseSizeMismatch { expected: 6, actual: 2 })
        ));
    }

    #[test]
    fn test_disabled_fallback() {
        init_logger();
        let bad = ChainSettings::new("tail", ["tail_0", "spine"]);
        let mut physics = VerletPhysics::new_or_disabled(tail_bones(), &[bad], Arc::new(CollisionSet::empty()));
        assert!(!physics.is_enabled());
        assert_eq!(physics.chain_count(), 0);

        let animated = tail_bones().reference_pose();
        let mut pose = animated.clone();
        physics.tick(&TickInput::new(1.0 / 60.0), &mut pose).unwrap();
        assert_eq!(pose, animated);
    }

    #[test]
    fn test_overlapping_chains_rejected() {
        let result = VerletPhysics::new(
            tail_bones(),
            &[tail_settings(), ChainSettings::new("tip", ["tail_2", "tuft"])],
            Arc::new(CollisionSet::empty()),
        );
        assert!(matches!(result, Err(VerletError::InvalidSetting { name: "chains", .. })));
    }

    #[test]
    fn test_teleport_moves_chain_with_root() {
        init_logger();
        let mut physics = tail_physics(CollisionSet::empty());
        let animated = tail_bones().reference_pose();
        let input = TickInput::new(1.0 / 60.0).with_gravity(Vec3::ZERO);

        let mut pose = animated.clone();
        for _ in 0..5 {
            pose.copy_from_slice(&animated);
            physics.tick(&input, &mut pose).unwrap();
        }

        // 整个角色瞬移 10 米
        let offset = Vec3::new(10.0, 0.0, 0.0);
        let moved: Vec<Mat4> = animated.iter().map(|m| Mat4::from_translation(offset) * *m).collect();
        pose.copy_from_slice(&moved);
        physics.tick(&input, &mut pose).unwrap();

        let chain = physics.chain("tail").unwrap();
        for particle in chain.particles() {
            assert!(particle.implicit_velocity().length() < 1e-4);
            assert!((particle.position - particle.pose_position).length() < 1e-4);
        }
        for (written, expected) in pose.iter().zip(&moved) {
            assert!(written.abs_diff_eq(*expected, 1e-4));
        }
    }

    #[test]
    fn test_reset_snaps_to_pose() {
        let mut physics = tail_physics(CollisionSet::empty());
        let animated = tail_bones().reference_pose();

        let mut pose = animated.clone();
        for _ in 0..30 {
            pose.copy_from_slice(&animated);
            physics.tick(&TickInput::new(1.0 / 60.0), &mut pose).unwrap();
        }
        assert!(!pose[3].abs_diff_eq(animated[3], 1e-3));

        pose.copy_from_slice(&animated);
        physics.tick(&TickInput::new(1.0 / 60.0).with_reset(ResetKind::ResetToPose), &mut pose).unwrap();
        for (written, expected) in pose.iter().zip(&animated) {
            assert!(written.abs_diff_eq(*expected, 1e-4));
        }
        for particle in physics.chain("tail").unwrap().particles() {
            assert_eq!(particle.implicit_velocity(), Vec3::ZERO);
        }

        // reset() 同样让下一帧吸附到动画姿态
        physics.tick(&TickInput::new(1.0 / 60.0), &mut pose).unwrap();
        physics.reset();
        pose.copy_from_slice(&animated);
        physics.tick(&TickInput::new(1.0 / 60.0), &mut pose).unwrap();
        for (written, expected) in pose.iter().zip(&animated) {
            assert!(written.abs_diff_eq(*expected, 1e-4));
        }
    }
    #[test]
    fn test_nested_chain_follows_upstream_chain() {
        init_logger();
        let bones = tail_bones();
        // 下游链写在前面，构建时按层次重新排序
        let settings = [
            ChainSettings::new("tuft", ["tail_2", "tuft"]),
            ChainSettings::new("tail", ["tail_0", "tail_1"]),
        ];
        let mut physics = VerletPhysics::new(bones.clone(), &settings, Arc::new(CollisionSet::empty())).unwrap();
        let names: Vec<&str> = physics.chains().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["tail", "tuft"]);

        let animated = bones.reference_pose();
        let mut pose = animated.clone();
        for _ in 0..120 {
            pose.copy_from_slice(&animated);
            physics.tick(&TickInput::new(1.0 / 60.0), &mut pose).unwrap();
        }

        // 上游链下垂，下游链的根跟着走，中间骨骼不被拉长
        assert!(position(&pose[2]).y < 0.95);
        assert!((position(&pose[3]).distance(position(&pose[2])) - 0.3).abs() < 1e-3);
        let tuft_length = Vec3::new(0.0, 0.05, -0.1).length();
        assert!((position(&pose[4]).distance(position(&pose[3])) - tuft_length).abs() < 1e-3);
        assert_eq!(physics.local_overrides().len(), 4);
    }

    #[test]
    fn test_reset_on_paused_frame_applies_next_tick() {
        let mut physics = tail_physics(CollisionSet::empty());
        let animated = tail_bones().reference_pose();

        let mut pose = animated.clone();
        for _ in 0..30 {
            pose.copy_from_slice(&animated);
            physics.tick(&TickInput::new(1.0 / 60.0), &mut pose).unwrap();
        }

        pose.copy_from_slice(&animated);
        physics
            .tick(&TickInput::new(0.0).with_reset(ResetKind::ResetToPose), &mut pose)
            .unwrap();
        assert_eq!(pose, animated);
        assert_eq!(physics.chain("tail").unwrap().pending_reset(), Some(ResetKind::ResetToPose));

        physics.tick(&TickInput::new(1.0 / 60.0), &mut pose).unwrap();
        for (written, expected) in pose.iter().zip(&animated) {
            assert!(written.abs_diff_eq(*expected, 1e-4));
        }
        for particle in physics.chain("tail").unwrap().particles() {
            assert_eq!(particle.implicit_velocity(), Vec3::ZERO);
        }
    }
}
