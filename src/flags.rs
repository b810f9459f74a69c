//! Interpose flags (spec §6): the small vocabulary that tells the host how a
//! freshly-built fan-out node should be wired into its VFS structures.

bitflags::bitflags! {
    /// How a lookup or revalidation result should be interposed into the
    /// host's dentry/inode structures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterposeFlags: u32 {
        /// A brand new lookup: the host should `d_instantiate`.
        const DEFAULT    = 0b0001;
        /// The host may `d_splice` a replacement dentry.
        const LOOKUP     = 0b0010;
        /// Reusing an existing inode on a positive re-lookup.
        const REVAL      = 0b0100;
        /// Re-lookup after a negative dentry.
        const REVAL_NEG  = 0b1000;
        /// Fill in only branches not yet populated on an existing node.
        const PARTIAL    = 0b1_0000;
    }
}
