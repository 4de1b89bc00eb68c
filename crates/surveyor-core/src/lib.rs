pub mod config;
pub mod report;
pub mod snapshot;

pub use config::{ConfigError, ConfigResult, SurveyorConfig, parse_duration};
pub use report::{
    CoreReport, CoreStats, DataStats, GatewayReport, NodeIdentity, NodeReport, ReportError,
    ReportResult, RouteReport,
};
pub use snapshot::{SurveyScope, SurveySnapshot};
