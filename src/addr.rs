use memory_addr::{def_usize_addr, def_usize_addr_formatter};

def_usize_addr! {
    /// Guest physical address.
    pub type GuestPhysAddr;
}

def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}
