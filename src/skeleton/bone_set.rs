//! 骨骼层次结构
//!
//! BoneSet 管理全部 BoneLink，构建时校验父子关系并缓存：
//! - 名称 → 索引映射
//! - 子骨骼列表
//! - 求值顺序（父骨骼总在子骨骼之前）

use std::collections::HashMap;

use glam::Mat4;

use super::{BoneLink, BoneTransform};
use crate::{Result, VerletError};

/// 骨骼层次结构
#[derive(Clone, Debug, Default)]
pub struct BoneSet {
    bones: Vec<BoneLink>,
    name_to_index: HashMap<String, usize>,
    children_cache: Vec<Vec<usize>>,
    eval_order: Vec<usize>,
}

impl BoneSet {
    /// 构建骨骼层次
    ///
    /// 失败条件：重名骨骼、父索引越界或指向自身、父子关系成环。
    pub fn new(mut bones: Vec<BoneLink>) -> Result<Self> {
        let count = bones.len();

        let mut name_to_index = HashMap::with_capacity(count);
        for (i, bone) in bones.iter_mut().enumerate() {
            bone.internal_id = i;
            if name_to_index.insert(bone.name.clone(), i).is_some() {
                return Err(VerletError::DuplicateBone(bone.name.clone()));
            }
        }

        let mut children_cache = vec![Vec::new(); count];
        for (i, bone) in bones.iter().enumerate() {
            if let Some(parent) = bone.parent_id() {
                if parent >= count || parent == i {
                    return Err(VerletError::InvalidSetting {
                        name: "parent_index",
                        reason: format!("bone '{}' has invalid parent {}", bone.name, parent),
                    });
                }
                children_cache[parent].push(i);
            }
        }

        // 从根骨骼深度优先展开，环上的骨骼永远不会被访问到
        let mut eval_order = Vec::with_capacity(count);
        let mut stack: Vec<usize> = (0..count).filter(|&i| bones[i].is_root()).rev().collect();
        while let Some(idx) = stack.pop() {
            eval_order.push(idx);
            stack.extend(children_cache[idx].iter().rev().copied());
        }
        if eval_order.len() != count {
            return Err(VerletError::InvalidSetting {
                name: "parent_index",
                reason: "bone hierarchy contains a cycle".to_string(),
            });
        }

        for &idx in &eval_order {
            bones[idx].is_leaf = children_cache[idx].is_empty();
            let local = bones[idx].reference.to_matrix();
            bones[idx].reference_to_world = match bones[idx].parent_id() {
                Some(parent) => bones[parent].reference_to_world * local,
                None => local,
            };
        }

        Ok(Self {
            bones,
            name_to_index,
            children_cache,
            eval_order,
        })
    }

    // ========================================
    // 查询
    // ========================================

    #[inline]
    pub fn len(&self) -> usize {
        self.bones.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    #[inline]
    pub fn bones(&self) -> &[BoneLink] {
        &self.bones
    }

    #[inline]
    pub fn bone(&self, idx: usize) -> Option<&BoneLink> {
        self.bones.get(idx)
    }

    /// 按名称查找骨骼索引
    #[inline]
    pub fn find_bone(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// 按名称查找骨骼索引，找不到时返回错误
    pub fn bone_index(&self, name: &str) -> Result<usize> {
        self.find_bone(name)
            .ok_or_else(|| VerletError::BoneNotFound(name.to_string()))
    }

    #[inline]
    pub fn parent_of(&self, idx: usize) -> Option<usize> {
        self.bones.get(idx).and_then(BoneLink::parent_id)
    }

    #[inline]
    pub fn children(&self, idx: usize) -> &[usize] {
        self.children_cache.get(idx).map_or(&[], Vec::as_slice)
    }

    /// 求值顺序（父先于子）
    #[inline]
    pub fn eval_order(&self) -> &[usize] {
        &self.eval_order
    }

    /// ancestor 是否为 idx 的祖先（不含自身）
    pub fn is_ancestor(&self, ancestor: usize, idx: usize) -> bool {
        let mut current = self.parent_of(idx);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.parent_of(parent);
        }
        false
    }

    /// 从根骨骼沿第一个子骨骼一直走到叶节点，返回沿途骨骼名称
    pub fn chain_from_root(&self, root: &str) -> Result<Vec<String>> {
        let mut idx = self.bone_index(root)?;
        let mut names = vec![self.bones[idx].name.clone()];
        while let Some(&child) = self.children(idx).first() {
            names.push(self.bones[child].name.clone());
            idx = child;
        }
        Ok(names)
    }

    // ========================================
    // 姿态换算
    // ========================================

    /// 校验姿态切片长度
    pub fn check_pose_len(&self, len: usize) -> Result<()> {
        if len != self.bones.len() {
            return Err(VerletError::PoseSizeMismatch {
                expected: self.bones.len(),
                actual: len,
            });
        }
        Ok(())
    }

    /// 参考姿态（世界空间）
    pub fn reference_pose(&self) -> Vec<Mat4> {
        self.bones.iter().map(|b| b.reference_to_world).collect()
    }

    /// 本地姿态 → 世界姿态
    pub fn local_to_world(&self, locals: &[BoneTransform]) -> Result<Vec<Mat4>> {
        self.check_pose_len(locals.len())?;
        let mut world = vec![Mat4::IDENTITY; locals.len()];
        for &idx in &self.eval_order {
            let local = locals[idx].to_matrix();
            world[idx] = match self.parent_of(idx) {
                Some(parent) => world[parent] * local,
                None => local,
            };
        }
        Ok(world)
    }

    /// 世界姿态 → 本地姿态
    pub fn world_to_local(&self, world: &[Mat4]) -> Result<Vec<Mat4>> {
        self.check_pose_len(world.len())?;
        Ok((0..world.len())
            .map(|idx| match self.parent_of(idx) {
                Some(parent) => world[parent].inverse() * world[idx],
                None => world[idx],
            })
            .collect())
    }

    /// 让被改动骨骼的后代保持原有本地变换
    ///
    /// `changed` 输入时标记已被覆盖的骨骼，返回时同时标记受影响的后代。
    /// 未被覆盖且祖先也未被改动的骨骼原样保留。
    pub fn propagate_to_descendants(
        &self,
        original: &[Mat4],
        pose: &mut [Mat4],
        changed: &mut [bool],
    ) {
        let count = self.bones.len();
        if original.len() != count || pose.len() != count || changed.len() != count {
            return;
        }

        for &idx in &self.eval_order {
            if changed[idx] {
                continue;
            }
            let Some(parent) = self.parent_of(idx) else {
                continue;
            };
            if changed[parent] {
                let local = original[parent].inverse() * original[idx];
                pose[idx] = pose[parent] * local;
                changed[idx] = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn make_tail() -> BoneSet {
        BoneSet::new(vec![
            BoneLink::new("hips"),
            BoneLink::new("tail_0").with_parent(0).with_offset(Vec3::new(0.0, 0.0, -0.2)),
            BoneLink::new("tail_1").with_parent(1).with_offset(Vec3::new(0.0, 0.0, -0.3)),
            BoneLink::new("tail_2").with_parent(2).with_offset(Vec3::new(0.0, 0.0, -0.3)),
            BoneLink::new("spine").with_parent(0).with_offset(Vec3::new(0.0, 0.5, 0.0)),
        ])
        .unwrap()
    }

    #[test]
    fn test_reference_pose_accumulates() {
        let bones = make_tail();
        let tip = bones.bone(3).unwrap().reference_position();
        assert!((tip - Vec3::new(0.0, 0.0, -0.8)).length() < 1e-5);
        assert!(bones.bone(3).unwrap().is_leaf());
        assert!(!bones.bone(0).unwrap().is_leaf());
    }

    #[test]
    fn test_find_and_chain_from_root() {
        let bones = make_tail();
        assert_eq!(bones.find_bone("tail_1"), Some(2));
        assert!(matches!(
            bones.bone_index("ear"),
            Err(VerletError::BoneNotFound(name)) if name == "ear"
        ));

        let chain = bones.chain_from_root("tail_0").unwrap();
        assert_eq!(chain, vec!["tail_0", "tail_1", "tail_2"]);
        assert!(bones.is_ancestor(0, 3));
        assert!(!bones.is_ancestor(4, 3));
    }

    #[test]
    fn test_invalid_hierarchy() {
        let duplicate = BoneSet::new(vec![BoneLink::new("a"), BoneLink::new("a")]);
        assert!(matches!(duplicate, Err(VerletError::DuplicateBone(_))));

        let cycle = BoneSet::new(vec![
            BoneLink::new("a").with_parent(1),
            BoneLink::new("b").with_parent(0),
        ]);
        assert!(matches!(cycle, Err(VerletError::InvalidSetting { .. })));

        let out_of_range = BoneSet::new(vec![BoneLink::new("a").with_parent(7)]);
        assert!(out_of_range.is_err());
    }

    #[test]
    fn test_local_world_round_trip() {
        let bones = make_tail();
        let mut locals: Vec<BoneTransform> = bones.bones().iter().map(|b| b.reference).collect();
        locals[1].rotation = Quat::from_rotation_x(0.4);

        let world = bones.local_to_world(&locals).unwrap();
        let back = bones.world_to_local(&world).unwrap();
        let recovered = BoneTransform::from_matrix(back[2]);
        assert!((recovered.translation - locals[2].translation).length() < 1e-5);

        assert!(matches!(
            bones.local_to_world(&locals[..2]),
            Err(VerletError::PoseSizeMismatch { expected: 5, actual: 2 })
        ));
    }

    #[test]
    fn test_propagate_keeps_local_offsets() {
        let bones = make_tail();
        let original = bones.reference_pose();
        let mut pose = original.clone();

        // 移动 tail_1，tail_2 应跟随，spine 保持不变
        pose[2] = Mat4::from_translation(Vec3::new(1.0, 0.0, -0.5));
        let mut changed = vec![false; bones.len()];
        changed[2] = true;
        bones.propagate_to_descendants(&original, &mut pose, &mut changed);

        let tail_2 = pose[3].col(3).truncate();
        assert!((tail_2 - Vec3::new(1.0, 0.0, -0.8)).length() < 1e-5);
        assert!(changed[3]);
        assert!(!changed[4]);
        assert_eq!(pose[4], original[4]);
    }
}
