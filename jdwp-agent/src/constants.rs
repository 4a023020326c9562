// Protocol constants served by the agent
//
// Command Sets handled here:
// 1  = VirtualMachine (suspend/resume/dispose)
// 9  = ObjectReference (collection pinning)
// 11 = ThreadReference (suspend/resume/suspend count)
// 15 = EventRequest (set/clear)
// 64 = Event (composite notifications, agent -> debugger)

pub mod command_sets {
    pub const VIRTUAL_MACHINE: u8 = 1;
    pub const OBJECT_REFERENCE: u8 = 9;
    pub const THREAD_REFERENCE: u8 = 11;
    pub const EVENT_REQUEST: u8 = 15;
    pub const EVENT: u8 = 64;
}

// VirtualMachine commands (set 1)
pub mod vm_commands {
    pub const DISPOSE: u8 = 6;
    pub const SUSPEND: u8 = 8;
    pub const RESUME: u8 = 9;
}

// ObjectReference commands (set 9)
pub mod object_commands {
    pub const DISABLE_COLLECTION: u8 = 7;
    pub const ENABLE_COLLECTION: u8 = 8;
    pub const IS_COLLECTED: u8 = 9;
}

// ThreadReference commands (set 11)
pub mod thread_commands {
    pub const SUSPEND: u8 = 2;
    pub const RESUME: u8 = 3;
    pub const SUSPEND_COUNT: u8 = 12;
}

// EventRequest commands (set 15)
pub mod event_request_commands {
    pub const SET: u8 = 1;
    pub const CLEAR: u8 = 2;
    pub const CLEAR_ALL_BREAKPOINTS: u8 = 3;
}

// Event commands (set 64)
pub mod event_commands {
    pub const COMPOSITE: u8 = 100;
}

// Modifier kinds for EventRequest.Set filter chains
pub mod modifier_kinds {
    pub const COUNT: u8 = 1;
    pub const CONDITIONAL: u8 = 2;
    pub const THREAD_ONLY: u8 = 3;
    pub const CLASS_ONLY: u8 = 4;
    pub const CLASS_MATCH: u8 = 5;
    pub const CLASS_EXCLUDE: u8 = 6;
    pub const LOCATION_ONLY: u8 = 7;
    pub const EXCEPTION_ONLY: u8 = 8;
    pub const FIELD_ONLY: u8 = 9;
    pub const STEP: u8 = 10;
    pub const INSTANCE_ONLY: u8 = 11;
    pub const SOURCE_NAME_MATCH: u8 = 12;
}

// Step sizes and depths carried by the Step modifier
pub mod step_sizes {
    pub const MIN: i32 = 0;
    pub const LINE: i32 = 1;
}

pub mod step_depths {
    pub const INTO: i32 = 0;
    pub const OVER: i32 = 1;
    pub const OUT: i32 = 2;
}

// One-byte kind tags for tagged identifiers
pub mod type_tags {
    pub const ARRAY: u8 = b'[';
    pub const OBJECT: u8 = b'L';
    pub const STRING: u8 = b's';
    pub const THREAD: u8 = b't';
    pub const THREAD_GROUP: u8 = b'g';
    pub const CLASS_LOADER: u8 = b'l';
    pub const CLASS_OBJECT: u8 = b'c';
}

// Location type tags
pub mod location_tags {
    pub const CLASS: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const ARRAY: u8 = 3;
}
