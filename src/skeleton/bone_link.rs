//! 骨骼节点
//!
//! BoneLink 是骨骼层次中的一个节点，只保存静态数据：
//! 名称、父子关系与参考姿态。每帧的动画姿态由宿主以矩阵切片传入。

use glam::{Mat4, Vec3};

use super::BoneTransform;

/// 骨骼节点
///
/// 变换计算：reference_to_world = parent.reference_to_world * reference.to_matrix()
#[derive(Clone, Debug)]
pub struct BoneLink {
    /// 骨骼名称
    pub name: String,

    /// 骨骼内部索引
    pub(crate) internal_id: usize,

    /// 父骨骼索引 (-1 表示根骨骼)
    pub parent_index: i32,

    /// 参考姿态（相对父骨骼）
    pub reference: BoneTransform,

    /// 参考姿态的世界变换（在 BoneSet 构建时计算）
    pub(crate) reference_to_world: Mat4,

    /// 是否为叶节点
    pub(crate) is_leaf: bool,
}

impl BoneLink {
    /// 创建新骨骼（根骨骼，参考姿态为单位变换）
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            internal_id: 0,
            parent_index: -1,
            reference: BoneTransform::default(),
            reference_to_world: Mat4::IDENTITY,
            is_leaf: true,
        }
    }

    /// 设置父骨骼
    pub fn with_parent(mut self, parent: usize) -> Self {
        self.parent_index = parent as i32;
        self
    }

    /// 设置参考姿态（相对父骨骼）
    pub fn with_reference(mut self, reference: BoneTransform) -> Self {
        self.reference = reference;
        self
    }

    /// 设置参考平移（相对父骨骼）
    pub fn with_offset(mut self, offset: Vec3) -> Self {
        self.reference.translation = offset;
        self
    }

    // ========================================
    // 访问器
    // ========================================

    /// 骨骼索引
    #[inline]
    pub fn link_id(&self) -> usize {
        self.internal_id
    }

    /// 父骨骼索引
    #[inline]
    pub fn parent_id(&self) -> Option<usize> {
        if self.parent_index >= 0 {
            Some(self.parent_index as usize)
        } else {
            None
        }
    }

    /// 是否为根骨骼
    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent_index < 0
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    /// 参考姿态的世界变换
    #[inline]
    pub fn reference_to_world(&self) -> Mat4 {
        self.reference_to_world
    }

    /// 参考姿态的世界位置
    #[inline]
    pub fn reference_position(&self) -> Vec3 {
        self.reference_to_world.col(3).truncate()
    }
}

impl Default for BoneLink {
    fn default() -> Self {
        Self::new(String::new())
    }
}
