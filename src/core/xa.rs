//! XA result codes and their severity ranking.
//!
//! The coordinator reports the most severe code over every resource of a
//! transaction, so a heuristic or integrity anomaly always wins over a
//! successful peer.

use std::fmt;

use serde::Serialize;

/// XA return codes, with their wire values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "&'static str")]
pub enum XaCode {
    RbRollback,
    RbCommFail,
    RbDeadlock,
    RbIntegrity,
    RbOther,
    RbProto,
    RbTimeout,
    RbTransient,
    NoMigrate,
    HeurHaz,
    HeurCom,
    HeurRb,
    HeurMix,
    Retry,
    ReadOnly,
    Ok,
    Async,
    RmErr,
    NotA,
    Inval,
    Proto,
    RmFail,
    DupId,
    Outside,
}

impl XaCode {
    pub const ALL: [XaCode; 24] = [
        XaCode::RbRollback,
        XaCode::RbCommFail,
        XaCode::RbDeadlock,
        XaCode::RbIntegrity,
        XaCode::RbOther,
        XaCode::RbProto,
        XaCode::RbTimeout,
        XaCode::RbTransient,
        XaCode::NoMigrate,
        XaCode::HeurHaz,
        XaCode::HeurCom,
        XaCode::HeurRb,
        XaCode::HeurMix,
        XaCode::Retry,
        XaCode::ReadOnly,
        XaCode::Ok,
        XaCode::Async,
        XaCode::RmErr,
        XaCode::NotA,
        XaCode::Inval,
        XaCode::Proto,
        XaCode::RmFail,
        XaCode::DupId,
        XaCode::Outside,
    ];

    pub fn raw(self) -> i32 {
        match self {
            XaCode::RbRollback => 100,
            XaCode::RbCommFail => 101,
            XaCode::RbDeadlock => 102,
            XaCode::RbIntegrity => 103,
            XaCode::RbOther => 104,
            XaCode::RbProto => 105,
            XaCode::RbTimeout => 106,
            XaCode::RbTransient => 107,
            XaCode::NoMigrate => 9,
            XaCode::HeurHaz => 8,
            XaCode::HeurCom => 7,
            XaCode::HeurRb => 6,
            XaCode::HeurMix => 5,
            XaCode::Retry => 4,
            XaCode::ReadOnly => 3,
            XaCode::Ok => 0,
            XaCode::Async => -2,
            XaCode::RmErr => -3,
            XaCode::NotA => -4,
            XaCode::Inval => -5,
            XaCode::Proto => -6,
            XaCode::RmFail => -7,
            XaCode::DupId => -8,
            XaCode::Outside => -9,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.raw() == raw)
    }

    /// Position in the severity ranking, 0 being the least severe.
    pub fn severity(self) -> u8 {
        match self {
            XaCode::ReadOnly => 0,
            XaCode::Ok => 1,
            XaCode::NotA => 2,
            XaCode::DupId => 3,
            XaCode::Retry => 4,
            XaCode::Async => 5,
            XaCode::Outside => 6,
            XaCode::NoMigrate => 7,
            XaCode::Inval => 8,
            XaCode::RbTransient => 9,
            XaCode::RbTimeout => 10,
            XaCode::RbProto => 11,
            XaCode::Proto => 12,
            XaCode::RbDeadlock => 13,
            XaCode::RbOther => 14,
            XaCode::RbRollback => 15,
            XaCode::RbCommFail => 16,
            XaCode::RbIntegrity => 17,
            XaCode::RmErr => 18,
            XaCode::RmFail => 19,
            XaCode::HeurRb => 20,
            XaCode::HeurCom => 21,
            XaCode::HeurMix => 22,
            XaCode::HeurHaz => 23,
        }
    }

    pub fn most_severe(self, other: XaCode) -> XaCode {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Most severe code of `codes`; read-only when there is none.
    pub fn aggregate(codes: impl IntoIterator<Item = XaCode>) -> XaCode {
        codes
            .into_iter()
            .fold(XaCode::ReadOnly, XaCode::most_severe)
    }

    /// Prepare outcomes that allow the transaction to commit.
    pub fn is_success(self) -> bool {
        matches!(self, XaCode::Ok | XaCode::ReadOnly)
    }

    pub fn is_rollback(self) -> bool {
        (100..=107).contains(&self.raw())
    }

    pub fn is_heuristic(self) -> bool {
        matches!(
            self,
            XaCode::HeurHaz | XaCode::HeurCom | XaCode::HeurRb | XaCode::HeurMix
        )
    }

    /// Codes that leave the resource unusable until it is recovered.
    pub fn is_resource_failure(self) -> bool {
        matches!(self, XaCode::RmFail | XaCode::RmErr)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            XaCode::RbRollback => "XA_RBROLLBACK",
            XaCode::RbCommFail => "XA_RBCOMMFAIL",
            XaCode::RbDeadlock => "XA_RBDEADLOCK",
            XaCode::RbIntegrity => "XA_RBINTEGRITY",
            XaCode::RbOther => "XA_RBOTHER",
            XaCode::RbProto => "XA_RBPROTO",
            XaCode::RbTimeout => "XA_RBTIMEOUT",
            XaCode::RbTransient => "XA_RBTRANSIENT",
            XaCode::NoMigrate => "XA_NOMIGRATE",
            XaCode::HeurHaz => "XA_HEURHAZ",
            XaCode::HeurCom => "XA_HEURCOM",
            XaCode::HeurRb => "XA_HEURRB",
            XaCode::HeurMix => "XA_HEURMIX",
            XaCode::Retry => "XA_RETRY",
            XaCode::ReadOnly => "XA_RDONLY",
            XaCode::Ok => "XA_OK",
            XaCode::Async => "XAER_ASYNC",
            XaCode::RmErr => "XAER_RMERR",
            XaCode::NotA => "XAER_NOTA",
            XaCode::Inval => "XAER_INVAL",
            XaCode::Proto => "XAER_PROTO",
            XaCode::RmFail => "XAER_RMFAIL",
            XaCode::DupId => "XAER_DUPID",
            XaCode::Outside => "XAER_OUTSIDE",
        }
    }
}

impl From<XaCode> for &'static str {
    fn from(code: XaCode) -> Self {
        code.as_str()
    }
}

impl fmt::Display for XaCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
