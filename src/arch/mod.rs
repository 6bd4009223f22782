pub mod interface;

pub use interface::{Arch, ContextOps, TrapFrameOps};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        mod arm;
        pub use arm::user_blob as arm_user_blob;
        pub use arm::UserTable;
        pub type TargetArch = arm::Armv7;
    } else {
        mod hosted;
        pub use hosted::UserTable;
        pub type TargetArch = hosted::Hosted;
    }
}

pub type Context = <TargetArch as Arch>::Context;
pub type TrapFrame = <TargetArch as Arch>::TrapFrame;
