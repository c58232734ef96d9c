//! qaflow run engine
//!
//! Turns plain-language test steps into browser actions and executes them:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  RunEngine                                                   │
//! │    ├── start(test_case, browser) -> RunHandle                │
//! │    │     ├── RunRegistry      single active run slot (CAS)   │
//! │    │     ├── BrowserRuntime   single-flight engine install   │
//! │    │     └── step loop                                       │
//! │    │           ├── parser      "Click \"Login\"" -> action   │
//! │    │           ├── BrowserSession.execute (timeout bounded)  │
//! │    │           └── ArtifactStore.capture (screenshot)        │
//! │    ├── cancel(run_id) -> CancelOutcome                       │
//! │    └── status / history / report                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  EventBus<RunEvent>, EventBus<InstallEvent>  push observation │
//! │  qaflow_common::Database                     pull observation │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod artifact;
pub mod browser;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod parser;
pub mod registry;

pub use artifact::{ArtifactError, ArtifactStore, Variant};
pub use browser::{BrowserRuntime, EngineInstaller, InstallError, PlaywrightInstaller};
pub use config::QaflowConfig;
pub use driver::{BrowserDriver, BrowserSession, DriverError, PlaywrightDriver};
pub use engine::{
    CancelOutcome, RunEngine, RunHandle, RunOptions, RunReport, RunStatusReport, MAX_STEP_TIMEOUT,
};
pub use error::{EngineError, EngineResult};
pub use events::{InstallEvent, InstallPhase, RunEvent};
pub use parser::{parse, ParsedAction};
