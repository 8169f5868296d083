use std::fmt;

use serde::{Deserialize, Serialize};

/// Metric identifies a canonical statistic shared by the live and trace paths.
///
/// Serialized names are the camelCase labels consumers plot against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Metric {
    PacketsSent,
    PacketsReceived,
    PacketsLost,
    PacketsDropped,
    Retransmitted,
    PacketsSendLost,
    BytesReceived,
    BytesLost,
    BytesDropped,
    RttMs,
    BandwidthMbps,
    ReceiveRateMbps,
    SendRateMbps,
    RcvBufferBytes,
    RcvBufferMs,
    FlowWindow,
    CongestionWindow,
    FlightSize,
    ControlPackets,
}

/// Number of canonical metrics, used for array sizing.
pub const METRIC_CARDINALITY: usize = 19;

impl Metric {
    /// All canonical metrics in declaration order.
    pub const ALL: [Metric; METRIC_CARDINALITY] = [
        Self::PacketsSent,
        Self::PacketsReceived,
        Self::PacketsLost,
        Self::PacketsDropped,
        Self::Retransmitted,
        Self::PacketsSendLost,
        Self::BytesReceived,
        Self::BytesLost,
        Self::BytesDropped,
        Self::RttMs,
        Self::BandwidthMbps,
        Self::ReceiveRateMbps,
        Self::SendRateMbps,
        Self::RcvBufferBytes,
        Self::RcvBufferMs,
        Self::FlowWindow,
        Self::CongestionWindow,
        Self::FlightSize,
        Self::ControlPackets,
    ];

    /// Returns the canonical label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PacketsSent => "packetsSent",
            Self::PacketsReceived => "packetsReceived",
            Self::PacketsLost => "packetsLost",
            Self::PacketsDropped => "packetsDropped",
            Self::Retransmitted => "retransmitted",
            Self::PacketsSendLost => "packetsSendLost",
            Self::BytesReceived => "bytesReceived",
            Self::BytesLost => "bytesLost",
            Self::BytesDropped => "bytesDropped",
            Self::RttMs => "rttMs",
            Self::BandwidthMbps => "bandwidthMbps",
            Self::ReceiveRateMbps => "receiveRateMbps",
            Self::SendRateMbps => "sendRateMbps",
            Self::RcvBufferBytes => "rcvBufferBytes",
            Self::RcvBufferMs => "rcvBufferMs",
            Self::FlowWindow => "flowWindow",
            Self::CongestionWindow => "congestionWindow",
            Self::FlightSize => "flightSize",
            Self::ControlPackets => "controlPackets",
        }
    }

    /// Maps a receiver CSV column name to its canonical metric.
    ///
    /// Accepts both the interval names (`pktRecv`) and the cumulative
    /// `*Total` spellings emitted by other receiver builds.
    pub fn from_receiver_column(name: &str) -> Option<Self> {
        let metric = match name {
            "pktSent" | "pktSentTotal" => Self::PacketsSent,
            "pktRecv" | "pktRecvTotal" => Self::PacketsReceived,
            "pktRcvLoss" | "pktRcvLossTotal" => Self::PacketsLost,
            "pktRcvDrop" | "pktRcvDropTotal" => Self::PacketsDropped,
            "pktRcvRetrans" | "pktRcvRetransTotal" => Self::Retransmitted,
            "pktSndLoss" | "pktSndLossTotal" => Self::PacketsSendLost,
            "byteRecv" | "byteRecvTotal" => Self::BytesReceived,
            "byteRcvLoss" | "byteRcvLossTotal" => Self::BytesLost,
            "byteRcvDrop" | "byteRcvDropTotal" => Self::BytesDropped,
            "msRTT" | "msRtt" => Self::RttMs,
            "mbpsBandwidth" => Self::BandwidthMbps,
            "mbpsRecvRate" => Self::ReceiveRateMbps,
            "mbpsSendRate" => Self::SendRateMbps,
            "byteAvailRcvBuf" => Self::RcvBufferBytes,
            "msRcvBuf" => Self::RcvBufferMs,
            "pktFlowWindow" => Self::FlowWindow,
            "pktCongestionWindow" => Self::CongestionWindow,
            "pktFlightSize" => Self::FlightSize,
            _ => return None,
        };
        Some(metric)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
