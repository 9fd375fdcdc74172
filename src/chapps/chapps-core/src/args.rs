/*
 * CHAPPS postfix policy delegate
 * Copyright (C) 2023 The CHAPPS developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
 */

use chapps_server::ServiceKind;

/// `chappsd` command-line arguments.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "Caching, highly-available Postfix policy delegate")]
pub struct Args {
    /// Which policy service this process runs.
    #[arg(value_enum, default_value = "outbound")]
    pub service: Service,

    /// Path of the configuration file (`$CHAPPS_CONFIG`, then
    /// `/etc/chapps/chappsd.ini`, when omitted).
    #[arg(short, long)]
    pub config: Option<std::path::PathBuf>,

    /// Mirror logs on stdout (file logging stays on).
    #[arg(long)]
    pub stdout: bool,
}

/// One process per policy, or one of the two multipolicy pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Service {
    /// Sender-domain authorisation, then outbound quota.
    Outbound,
    /// SPF enforcement, then greylisting.
    Inbound,
    /// Outbound quota alone.
    OutboundQuota,
    /// Sender-domain authorisation alone.
    SenderDomainAuth,
    /// Greylisting alone.
    Greylisting,
    /// SPF enforcement alone.
    SpfEnforcement,
}

impl From<Service> for ServiceKind {
    fn from(service: Service) -> Self {
        match service {
            Service::Outbound => Self::Outbound,
            Service::Inbound => Self::Inbound,
            Service::OutboundQuota => Self::OutboundQuota,
            Service::SenderDomainAuth => Self::SenderDomainAuth,
            Service::Greylisting => Self::Greylisting,
            Service::SpfEnforcement => Self::SpfEnforcement,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn the_default_service_is_the_outbound_multipolicy() {
        let args = Args::parse_from(["chappsd"]);
        assert_eq!(args.service, Service::Outbound);
        assert_eq!(args.config, None);
        assert!(!args.stdout);
    }

    #[test]
    fn services_parse_from_kebab_case() {
        let args = Args::parse_from(["chappsd", "spf-enforcement", "-c", "/tmp/x.ini"]);
        assert_eq!(args.service, Service::SpfEnforcement);
        assert_eq!(args.config, Some("/tmp/x.ini".into()));
    }
}
