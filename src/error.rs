//! Error types for partition, query, and state operations.
use thiserror::Error;

/// Errors that can arise when manipulating a CRP partition
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CrpError {
    /// The concentration parameter is not finite and positive
    #[error("alpha must be finite and greater than zero, got {0}")]
    InvalidAlpha(f64),
    /// Attempted to incorporate an item that is already a member
    #[error("item {0} is already incorporated")]
    DuplicateItem(usize),
    /// Attempted to unincorporate an item that is not a member
    #[error("item {0} is not incorporated")]
    UnknownItem(usize),
}

/// Errors that can arise when validating or evaluating a query
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    /// A variable appears in both the query and the evidence
    #[error("query and evidence share variables: {0:?}")]
    QueryEvidenceOverlap(Vec<usize>),
    /// A simulation target appears more than once
    #[error("duplicate simulation target: {0}")]
    DuplicateTarget(usize),
    /// The query names a variable no component produces
    #[error("unknown variable: {0}")]
    UnknownVariable(usize),
    /// The query targets a cell whose value is already recorded
    #[error("cell ({row}, {col}) is observed and cannot be queried")]
    QueryTargetsObservedCell { row: usize, col: usize },
    /// The evidence contradicts a recorded cell value
    #[error("evidence contradicts observed cell ({row}, {col})")]
    EvidenceContradictsObservedCell { row: usize, col: usize },
    /// Cluster assignments of incorporated rows are determined by the
    /// partition and cannot be constrained or queried
    #[error("cannot constrain the cluster assignment of observed row {0}")]
    ClusterConstraintOnObservedRow(usize),
    /// Every candidate cluster gives the evidence zero density
    #[error("evidence has zero density under every candidate cluster")]
    DegenerateEvidence,
    /// A component requires inputs the network cannot provide
    #[error("missing required inputs: {0:?}")]
    MissingInputs(Vec<usize>),
    /// The row is already incorporated
    #[error("row {0} is already incorporated")]
    DuplicateRow(usize),
    /// The row is not incorporated
    #[error("row {0} is not incorporated")]
    UnknownRow(usize),
    /// A value passed to incorporate was the missing sentinel or otherwise
    /// unusable
    #[error("invalid value {value} for variable {col}")]
    InvalidValue { col: usize, value: f64 },
    /// The query could not be dispatched at all, for a reason outside the
    /// query itself
    #[error("query dispatch failed: {0}")]
    Dispatch(String),
}

/// Errors that can arise when wiring components into a dependency network
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NetworkError {
    /// Two components claim the same output variable
    #[error("output variable {0} is produced by more than one component")]
    DuplicateOutput(usize),
    /// The component graph contains a directed cycle
    #[error("the component graph contains a cycle")]
    Cycle,
}

/// Errors that can arise from operations on a `State`
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    /// Rows append at the end only
    #[error("rows are append-only: expected rowid {expected}, got {got}")]
    NonContiguousRow { expected: usize, got: usize },
    /// Only the final row may be removed
    #[error("only the last row ({last}) may be unincorporated, got {got}")]
    NotLastRow { last: usize, got: usize },
    /// At least one row must remain
    #[error("cannot unincorporate the only remaining row")]
    LastRemainingRow,
    /// At least one column must remain
    #[error("cannot unincorporate the only remaining column")]
    LastRemainingColumn,
    /// The column already exists
    #[error("column {0} already exists")]
    DuplicateColumn(usize),
    /// The column does not exist
    #[error("column {0} does not exist")]
    UnknownColumn(usize),
    /// A column's data do not span the table
    #[error("column {col} has {got} values, expected {expected}")]
    ColumnLengthMismatch {
        col: usize,
        expected: usize,
        got: usize,
    },
    /// A state requires at least one column and one row of data
    #[error("a state requires at least one column and one row")]
    EmptyTable,
    /// An initial row partition does not span the table
    #[error("row partition for view {view} has {got} entries, expected {expected}")]
    RowPartitionLength {
        view: usize,
        expected: usize,
        got: usize,
    },
    /// Parallel bulk-query arguments disagree in length
    #[error("bulk arguments have mismatched lengths: {0} vs {1}")]
    BulkLengthMismatch(usize, usize),
    /// A pairwise query was given an empty variable set
    #[error("variable sets must be non-empty")]
    EmptyTargets,
    /// Column reassignment is undefined while conditional columns exist
    #[error("cannot reassign columns while column {0} has inputs")]
    ConditionalColumn(usize),
    /// An independence constraint names a column twice
    #[error("independence constraint pairs column {0} with itself")]
    SelfConstraint(usize),
    /// The initial column partition violates an independence constraint
    #[error("columns {0} and {1} are constrained independent but share a view")]
    ConstraintViolation(usize, usize),
    /// No component is hooked under this token
    #[error("unknown component token: {0}")]
    UnknownToken(usize),
    /// A hooked component's outputs collide with existing variables
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Crp(#[from] CrpError),
}

/// Failures surfaced by expensive structural validation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConsistencyError {
    #[error("cluster {cluster} occupancy is {counted}, recorded {recorded}")]
    OccupancyMismatch {
        cluster: usize,
        counted: usize,
        recorded: usize,
    },
    #[error("cluster {0} is recorded with zero occupancy")]
    EmptyCluster(usize),
    #[error("cluster id {0} is not below the arena watermark")]
    StaleArenaWatermark(usize),
    #[error("column {col} tracks cluster {cluster} unknown to the row partition")]
    UnknownClusterInColumn { col: usize, cluster: usize },
    #[error("column {col} membership disagrees with the row partition")]
    ColumnMembershipMismatch { col: usize },
}
